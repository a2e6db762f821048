//! Controller handshake.
//!
//! Each side sends `HELLO` with its protocol version, site id and the hop
//! distance to every branch origin it can reach, and answers the peer's
//! `HELLO` with `HELLO_ACK`. The connection is established once both have
//! happened.

use fabric_error::{FabricError, Result};
use fabric_mvcc::Site;
use fabric_types::SiteId;

use crate::command::PROTOCOL_VERSION;
use crate::frame::{Frame, Hello};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    HelloSent { acked: bool },
    Established,
}

#[derive(Debug)]
pub struct Controller {
    local: SiteId,
    state: Handshake,
    peer: Option<SiteId>,
}

impl Controller {
    #[must_use]
    pub const fn new(local: SiteId) -> Self {
        Self {
            local,
            state: Handshake::Idle,
            peer: None,
        }
    }

    /// Build our `HELLO`.
    pub fn hello(&mut self, site: &Site) -> Frame {
        if self.state == Handshake::Idle {
            self.state = Handshake::HelloSent { acked: false };
        }
        Frame::Hello(Hello {
            version: PROTOCOL_VERSION,
            site: self.local,
            distances: site.distances(),
        })
    }

    /// Handle the peer's `HELLO`: learn distances and produce the ack.
    pub fn on_hello(&mut self, hello: &Hello, site: &Site) -> Result<Frame> {
        check_version(hello.version)?;
        if hello.site == self.local {
            return Err(FabricError::protocol(format!(
                "connection to self ({})",
                hello.site
            )));
        }
        if let Some(peer) = self.peer {
            if peer != hello.site {
                return Err(FabricError::protocol(format!(
                    "peer changed identity from {peer} to {}",
                    hello.site
                )));
            }
        }
        self.peer = Some(hello.site);
        for &(branch, distance) in &hello.distances {
            site.learn_distance(branch, distance);
        }
        tracing::debug!(
            peer = %hello.site,
            branches = hello.distances.len(),
            "controller: hello received"
        );
        self.advance();
        Ok(Frame::HelloAck {
            version: PROTOCOL_VERSION,
            site: self.local,
        })
    }

    pub fn on_hello_ack(&mut self, version: u16, site: SiteId) -> Result<()> {
        check_version(version)?;
        let Handshake::HelloSent { .. } = self.state else {
            return Err(FabricError::protocol("HELLO_ACK without a HELLO"));
        };
        if self.peer.is_some_and(|peer| peer != site) {
            return Err(FabricError::protocol(format!(
                "HELLO_ACK from {site} does not match the peer"
            )));
        }
        self.state = Handshake::HelloSent { acked: true };
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        if self.state == (Handshake::HelloSent { acked: true }) && self.peer.is_some() {
            self.state = Handshake::Established;
            tracing::info!(local = %self.local, peer = ?self.peer, "controller: handshake complete");
        }
    }

    #[must_use]
    pub const fn peer(&self) -> Option<SiteId> {
        self.peer
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == Handshake::Established
    }
}

fn check_version(version: u16) -> Result<()> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(FabricError::protocol(format!(
            "protocol version {version}, expected {PROTOCOL_VERSION}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_mvcc::{FabricConfig, ObjectModel, RegistryModel};
    use fabric_types::BranchId;
    use std::sync::Arc;

    fn site(seed: &[u8]) -> Arc<Site> {
        let model: Arc<dyn ObjectModel> = Arc::new(RegistryModel::new());
        Site::new(SiteId::derive(seed), model, FabricConfig::default(), None).unwrap()
    }

    fn unwrap_hello(frame: Frame) -> Hello {
        match frame {
            Frame::Hello(hello) => hello,
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn handshake_learns_distances() {
        let (a, b) = (site(b"a"), site(b"b"));
        let origin = a.create_branch().unwrap();
        let (mut ca, mut cb) = (Controller::new(a.id()), Controller::new(b.id()));

        let hello_a = unwrap_hello(ca.hello(&a));
        let hello_b = unwrap_hello(cb.hello(&b));
        assert_eq!(hello_a.distances, vec![(origin.id(), 0)]);

        let Frame::HelloAck { version, site: s } = cb.on_hello(&hello_a, &b).unwrap() else {
            panic!("expected ack");
        };
        ca.on_hello_ack(version, s).unwrap();
        assert!(!ca.is_established());
        let Frame::HelloAck { version, site: s } = ca.on_hello(&hello_b, &a).unwrap() else {
            panic!("expected ack");
        };
        cb.on_hello_ack(version, s).unwrap();

        assert!(ca.is_established() && cb.is_established());
        assert_eq!(ca.peer(), Some(b.id()));
        assert_eq!(b.distance_to(origin.id()), Some(1));
    }

    #[test]
    fn version_mismatch_is_a_protocol_error() {
        let (a, b) = (site(b"a"), site(b"b"));
        let mut cb = Controller::new(b.id());
        let hello = Hello {
            version: PROTOCOL_VERSION + 1,
            site: a.id(),
            distances: vec![(BranchId::new(9).unwrap(), 0)],
        };
        assert!(matches!(cb.on_hello(&hello, &b), Err(FabricError::Protocol { .. })));
        assert_eq!(b.distance_to(BranchId::new(9).unwrap()), None);
    }

    #[test]
    fn self_connection_and_stray_ack_are_rejected() {
        let a = site(b"a");
        let mut ca = Controller::new(a.id());
        assert!(ca.on_hello_ack(PROTOCOL_VERSION, a.id()).is_err());
        let hello = unwrap_hello(ca.hello(&a));
        assert!(ca.on_hello(&hello, &a).is_err());
    }
}
