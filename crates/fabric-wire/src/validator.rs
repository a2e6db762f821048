//! Policy hooks for remote input.
//!
//! A rejection is fatal to the connection that carried the input.

use std::collections::HashSet;

use fabric_error::{FabricError, Result};
use fabric_mvcc::TObject;
use fabric_types::{ClassId, ConnectionId};

/// Checks applied to everything a peer asks of this site. Every method
/// defaults to allowing the operation.
pub trait Validator: Send + Sync {
    /// The peer is about to receive a reference to `object`.
    fn validate_read(&self, _connection: ConnectionId, _object: &TObject) -> Result<()> {
        Ok(())
    }

    /// A map from the peer writes to `object`.
    fn validate_write(&self, _connection: ConnectionId, _object: &TObject) -> Result<()> {
        Ok(())
    }

    fn validate_method_call(
        &self,
        _connection: ConnectionId,
        _object: &TObject,
        _method: &str,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Validator for AllowAll {}

/// Rejects remote writes to instances of the listed classes.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyClasses {
    classes: HashSet<ClassId>,
}

impl ReadOnlyClasses {
    #[must_use]
    pub fn new(classes: impl IntoIterator<Item = ClassId>) -> Self {
        Self {
            classes: classes.into_iter().collect(),
        }
    }
}

impl Validator for ReadOnlyClasses {
    fn validate_write(&self, connection: ConnectionId, object: &TObject) -> Result<()> {
        if self.classes.contains(&object.class_id()) {
            return Err(FabricError::Validation {
                detail: format!(
                    "{connection} may not write {} of class {}",
                    object.id(),
                    object.class().name()
                ),
            });
        }
        Ok(())
    }
}

/// Run a validator hook, reporting any failure as a validation error.
pub(crate) fn check(outcome: Result<()>) -> Result<()> {
    outcome.map_err(|err| match err {
        FabricError::Validation { .. } => err,
        other => FabricError::Validation {
            detail: other.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_mvcc::{ClassDescriptor, ClassShape};
    use fabric_types::ObjectId;
    use std::sync::Arc;

    fn object(class: i32) -> TObject {
        let descriptor = ClassDescriptor::new(ClassId::new(class), "C", ClassShape::Fields { count: 1 });
        TObject::new(ObjectId::new(1).unwrap(), Arc::new(descriptor), 0)
    }

    #[test]
    fn read_only_classes_reject_writes_only() {
        let conn = ConnectionId::new(1).unwrap();
        let validator = ReadOnlyClasses::new([ClassId::new(7)]);
        assert!(validator.validate_write(conn, &object(7)).is_err());
        assert!(validator.validate_write(conn, &object(8)).is_ok());
        assert!(validator.validate_read(conn, &object(7)).is_ok());
        assert!(validator.validate_method_call(conn, &object(7), "m").is_ok());
        assert!(AllowAll.validate_write(conn, &object(7)).is_ok());
    }

    #[test]
    fn foreign_errors_become_validation_errors() {
        let err = check(Err(FabricError::invalid_state("nope"))).unwrap_err();
        assert!(matches!(err, FabricError::Validation { .. }));
    }
}
