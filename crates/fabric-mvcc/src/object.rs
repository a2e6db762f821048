//! Object model boundary.
//!
//! The engine never generates or inspects application classes. It asks an
//! [`ObjectModel`] to describe a numeric class id and works from the returned
//! [`ClassDescriptor`]. Negative ids are built-in collection classes and are
//! answered without consulting the application.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fabric_bits::Bits;
use fabric_error::{FabricError, Result};
use fabric_types::{ClassId, ObjectId};
use parking_lot::RwLock;

/// How instances of a class store their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassShape {
    /// Fixed set of indexed fields.
    Fields { count: u32 },
    /// Indexed elements whose count is chosen per instance.
    Array,
    /// Keyed collection of values.
    Map,
    /// Keyed collection with keys only.
    Set,
}

impl ClassShape {
    #[must_use]
    pub const fn is_keyed(self) -> bool {
        matches!(self, Self::Map | Self::Set)
    }
}

/// Runtime description of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    shape: ClassShape,
    /// Fields only the owning site may write; remote writes to them are
    /// accepted once.
    read_only: Vec<u32>,
    /// Instances never change after creation.
    immutable: bool,
    /// Element class for generic built-ins.
    element: Option<ClassId>,
}

impl ClassDescriptor {
    #[must_use]
    pub fn new(id: ClassId, name: impl Into<String>, shape: ClassShape) -> Self {
        Self {
            id,
            name: name.into(),
            shape,
            read_only: Vec::new(),
            immutable: false,
            element: None,
        }
    }

    #[must_use]
    pub fn with_read_only(mut self, fields: impl IntoIterator<Item = u32>) -> Self {
        self.read_only = fields.into_iter().collect();
        self.read_only.sort_unstable();
        self.read_only.dedup();
        self
    }

    #[must_use]
    pub const fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    #[must_use]
    pub const fn id(&self) -> ClassId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn shape(&self) -> ClassShape {
        self.shape
    }

    #[must_use]
    pub const fn is_immutable(&self) -> bool {
        self.immutable
    }

    #[must_use]
    pub const fn element(&self) -> Option<ClassId> {
        self.element
    }

    /// Read-only fields as a bitset.
    #[must_use]
    pub fn read_only_bits(&self) -> Bits {
        self.read_only.iter().copied().collect()
    }

    #[must_use]
    pub fn has_read_only_fields(&self) -> bool {
        !self.read_only.is_empty()
    }
}

/// Handle to a replicated object: identity plus shape.
#[derive(Clone, PartialEq, Eq)]
pub struct TObject {
    id: ObjectId,
    class: Arc<ClassDescriptor>,
    length: u32,
}

impl TObject {
    #[must_use]
    pub fn new(id: ObjectId, class: Arc<ClassDescriptor>, length: u32) -> Self {
        let length = match class.shape {
            ClassShape::Fields { count } => count,
            ClassShape::Array => length,
            ClassShape::Map | ClassShape::Set => 0,
        };
        Self { id, class, length }
    }

    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    #[must_use]
    pub fn class_id(&self) -> ClassId {
        self.class.id
    }

    /// Number of indexed slots (fields or array elements).
    #[must_use]
    pub const fn length(&self) -> u32 {
        self.length
    }

    #[must_use]
    pub fn is_keyed(&self) -> bool {
        self.class.shape.is_keyed()
    }

    /// Check that `index` addresses a slot of this object.
    pub fn check_index(&self, index: u32) -> Result<()> {
        if self.is_keyed() {
            return Err(FabricError::TypeMismatch {
                expected: "indexed object",
                actual: "keyed collection",
            });
        }
        if index >= self.length {
            return Err(FabricError::FieldOutOfRange {
                class_id: self.class.id.get(),
                index,
                count: self.length,
            });
        }
        Ok(())
    }

    pub fn check_keyed(&self) -> Result<()> {
        if self.is_keyed() {
            Ok(())
        } else {
            Err(FabricError::TypeMismatch {
                expected: "keyed collection",
                actual: "indexed object",
            })
        }
    }
}

impl fmt::Debug for TObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TObject({} {} len={})", self.id, self.class.id, self.length)
    }
}

/// Resolves class ids to descriptors.
pub trait ObjectModel: Send + Sync {
    /// Describe `class`, specialized by `generics` for generic built-ins.
    fn describe(&self, class: ClassId, generics: &[ClassId]) -> Result<Arc<ClassDescriptor>>;

    /// Create a handle for a new instance of `class`.
    fn instantiate(
        &self,
        class: ClassId,
        generics: &[ClassId],
        id: ObjectId,
        length: u32,
    ) -> Result<TObject> {
        Ok(TObject::new(id, self.describe(class, generics)?, length))
    }
}

/// Descriptor of a built-in class, `None` for non-negative ids.
#[must_use]
pub fn builtin_descriptor(class: ClassId, generics: &[ClassId]) -> Option<ClassDescriptor> {
    let (name, shape) = match class {
        ClassId::ARRAY => ("array", ClassShape::Array),
        ClassId::MAP => ("map", ClassShape::Map),
        ClassId::SET => ("set", ClassShape::Set),
        _ => return None,
    };
    let mut descriptor = ClassDescriptor::new(class, name, shape);
    descriptor.element = generics.first().copied();
    Some(descriptor)
}

/// Registry-backed model: built-ins plus classes registered at startup.
#[derive(Default)]
pub struct RegistryModel {
    classes: RwLock<HashMap<ClassId, Arc<ClassDescriptor>>>,
}

impl RegistryModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application class. Negative ids are reserved.
    pub fn register(&self, descriptor: ClassDescriptor) -> Result<Arc<ClassDescriptor>> {
        if descriptor.id.is_builtin() {
            return Err(FabricError::config(format!(
                "{} is reserved for built-in classes",
                descriptor.id
            )));
        }
        let descriptor = Arc::new(descriptor);
        self.classes
            .write()
            .insert(descriptor.id, Arc::clone(&descriptor));
        tracing::debug!(class = %descriptor.id, name = descriptor.name(), "class registered");
        Ok(descriptor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}

impl ObjectModel for RegistryModel {
    fn describe(&self, class: ClassId, generics: &[ClassId]) -> Result<Arc<ClassDescriptor>> {
        if let Some(builtin) = builtin_descriptor(class, generics) {
            return Ok(Arc::new(builtin));
        }
        self.classes
            .read()
            .get(&class)
            .cloned()
            .ok_or(FabricError::ClassNotFound {
                class_id: class.get(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn builtins_resolve_without_registration() {
        let model = RegistryModel::new();
        let array = model.describe(ClassId::ARRAY, &[ClassId::new(7)]).unwrap();
        assert_eq!(array.shape(), ClassShape::Array);
        assert_eq!(array.element(), Some(ClassId::new(7)));
        assert!(model.describe(ClassId::MAP, &[]).unwrap().shape().is_keyed());
        assert!(model.is_empty());
    }

    #[test]
    fn unknown_class_is_an_error() {
        let model = RegistryModel::new();
        let err = model.describe(ClassId::new(42), &[]).unwrap_err();
        assert!(matches!(err, FabricError::ClassNotFound { class_id: 42 }));
    }

    #[test]
    fn reserved_ids_cannot_be_registered() {
        let model = RegistryModel::new();
        let err = model
            .register(ClassDescriptor::new(ClassId::new(-9), "x", ClassShape::Array))
            .unwrap_err();
        assert!(matches!(err, FabricError::Config { .. }));
    }

    #[test]
    fn instantiate_uses_shape_length() {
        let model = RegistryModel::new();
        model
            .register(ClassDescriptor::new(
                ClassId::new(1),
                "Point",
                ClassShape::Fields { count: 3 },
            ))
            .unwrap();
        let point = model.instantiate(ClassId::new(1), &[], oid(1), 99).unwrap();
        assert_eq!(point.length(), 3);
        let array = model.instantiate(ClassId::ARRAY, &[], oid(2), 99).unwrap();
        assert_eq!(array.length(), 99);
        let map = model.instantiate(ClassId::MAP, &[], oid(3), 99).unwrap();
        assert_eq!(map.length(), 0);
    }

    #[test]
    fn index_checks() {
        let class = Arc::new(ClassDescriptor::new(
            ClassId::new(1),
            "Pair",
            ClassShape::Fields { count: 2 },
        ));
        let obj = TObject::new(oid(1), class, 0);
        assert!(obj.check_index(1).is_ok());
        assert!(matches!(
            obj.check_index(2),
            Err(FabricError::FieldOutOfRange { index: 2, count: 2, .. })
        ));
        assert!(obj.check_keyed().is_err());
    }

    #[test]
    fn read_only_bits_are_deduplicated() {
        let class = ClassDescriptor::new(ClassId::new(1), "Owned", ClassShape::Fields { count: 4 })
            .with_read_only([3, 0, 3]);
        assert_eq!(class.read_only_bits().indices(), vec![0, 3]);
        assert!(class.has_read_only_fields());
    }
}
