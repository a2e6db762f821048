//! Wire protocol for the fabric engine.
//!
//! Everything here is resumable: readers and writers stop at the first byte
//! they cannot consume or produce and carry on from there on the next call,
//! so one thread can serve many connections without blocking.
//!
//! Layers, bottom up:
//!
//! - [`scalar`], [`value_codec`], [`version_codec`]: suspendable encodings
//!   of scalars, values and version maps.
//! - [`frame`]: `flags | command | body` frames and per-direction codecs.
//! - [`controller`], [`call`], [`dgc`], [`heartbeat`], [`validator`]: the
//!   protocol layers stacked on one connection.
//! - [`connection`]: the endpoint tying them to a [`fabric_mvcc::Site`].
//! - [`loopback`]: a socket-free transport for tests and embedding.

pub mod buf;
pub mod call;
pub mod command;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dgc;
pub mod frame;
pub mod heartbeat;
pub mod loopback;
pub mod observability;
pub mod scalar;
pub mod validator;
pub mod value_codec;
pub mod version_codec;

pub use buf::{InBuf, OutBuf, Progress};
pub use call::{CallFuture, CallHandler, CallQueue, CallTable, NoHandler};
pub use command::{FrameFlags, Layer, MAX_COMMAND_ID, PROTOCOL_VERSION};
pub use config::WireConfig;
pub use connection::{AcceptAll, Authority, Connection, OverloadCallback, ReplicationMode};
pub use controller::Controller;
pub use dgc::RemoteReferences;
pub use frame::{CallOutcome, CallRequest, Frame, FrameReader, FrameWriter, Hello, RemoteFailure};
pub use heartbeat::{HeartbeatAction, HeartbeatTimer};
pub use loopback::Loopback;
pub use observability::{WireMetricsSnapshot, reset_wire_metrics, wire_metrics_snapshot};
pub use validator::{AllowAll, ReadOnlyClasses, Validator};
pub use version_codec::{MapReader, MapWriter, ObjectHeader, ObjectResolver};
