//! Command bytes and framing flags.
//!
//! Every frame starts with a flags byte and a command byte. The framing
//! layer owns the ids below [`MAX_COMMAND_ID`]; each protocol layer owns a
//! block of [`LAYER_WIDTH`] ids above it, so layers stacked on one
//! connection never collide.

use bitflags::bitflags;
use fabric_error::{FabricError, Result};

/// Bumped whenever a command or payload layout changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Watermark separating framing commands from layer commands.
pub const MAX_COMMAND_ID: u8 = 16;

/// Ids owned by each layer.
pub const LAYER_WIDTH: u8 = 8;

bitflags! {
    /// Framing flags. `TOBJECT` and `IMMUTABLE` also appear per version
    /// inside map frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// An object header (class and shape) precedes the version.
        const TOBJECT = 0x01;
        /// Last frame the sender will write.
        const EOF = 0x02;
        /// The object's class is immutable.
        const IMMUTABLE = 0x04;
    }
}

// Framing
pub const HEARTBEAT: u8 = 1;
pub const CLOSE: u8 = 2;

// Controller
pub const CONTROLLER_BASE: u8 = MAX_COMMAND_ID;
pub const HELLO: u8 = CONTROLLER_BASE;
pub const HELLO_ACK: u8 = CONTROLLER_BASE + 1;

// Replication and interception
pub const INTERCEPTOR_BASE: u8 = MAX_COMMAND_ID + LAYER_WIDTH;
pub const MAP: u8 = INTERCEPTOR_BASE;
pub const INTERCEPTION_END: u8 = INTERCEPTOR_BASE + 1;
pub const ACK: u8 = INTERCEPTOR_BASE + 2;
pub const NACK: u8 = INTERCEPTOR_BASE + 3;

// Method calls
pub const CALL_BASE: u8 = MAX_COMMAND_ID + 2 * LAYER_WIDTH;
pub const CALL: u8 = CALL_BASE;
pub const RESULT: u8 = CALL_BASE + 1;
pub const CANCEL: u8 = CALL_BASE + 2;

// Distributed GC
pub const DGC_BASE: u8 = MAX_COMMAND_ID + 3 * LAYER_WIDTH;
pub const DGC_REFERENCE: u8 = DGC_BASE;
pub const DGC_RELEASE: u8 = DGC_BASE + 1;

/// Protocol layer owning a command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Framing,
    Controller,
    Interceptor,
    Call,
    Dgc,
}

impl Layer {
    #[must_use]
    pub const fn of(command: u8) -> Option<Self> {
        if command < MAX_COMMAND_ID {
            return Some(Self::Framing);
        }
        match (command - MAX_COMMAND_ID) / LAYER_WIDTH {
            0 => Some(Self::Controller),
            1 => Some(Self::Interceptor),
            2 => Some(Self::Call),
            3 => Some(Self::Dgc),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Framing => "framing",
            Self::Controller => "controller",
            Self::Interceptor => "interceptor",
            Self::Call => "call",
            Self::Dgc => "dgc",
        }
    }
}

/// Error for a command byte no layer knows.
pub(crate) fn unknown(command: u8) -> FabricError {
    FabricError::UnknownCommand {
        layer: Layer::of(command).map_or("none", Layer::name),
        command,
    }
}

/// Check that `command` names a frame this build can decode.
pub fn check(command: u8) -> Result<()> {
    match command {
        HEARTBEAT | CLOSE | HELLO | HELLO_ACK | MAP | INTERCEPTION_END | ACK | NACK | CALL
        | RESULT | CANCEL | DGC_REFERENCE | DGC_RELEASE => Ok(()),
        other => Err(unknown(other)),
    }
}
