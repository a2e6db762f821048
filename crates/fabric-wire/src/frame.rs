//! Frames and the per-direction frame codecs.
//!
//! ```text
//! frame   = flags u8 | command u8 | body
//! MAP     body is streamed (see `version_codec`)
//! others  body = length u32 | bytes
//! ```
//!
//! [`FrameWriter`] and [`FrameReader`] each run on one side of one
//! connection. Both stop at the first byte they cannot write or read and
//! pick up exactly there on the next call.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use fabric_error::{ErrorCode, FabricError, Result};
use fabric_mvcc::VersionMap;
use fabric_types::{BranchId, CallId, ConnectionId, InterceptionId, ObjectId, SiteId, Value};

use crate::buf::{InBuf, OutBuf, Progress};
use crate::command::{self, FrameFlags};
use crate::config::WireConfig;
use crate::scalar::{ScalarReader, ScalarWriter};
use crate::value_codec::{ValueReader, stage_value};
use crate::version_codec::{MapReader, MapWriter, ObjectResolver};

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

/// Controller handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub site: SiteId,
    /// Hops from the sender to the origin of each branch it knows.
    pub distances: Vec<(BranchId, u32)>,
}

/// Remote method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub call: CallId,
    pub object: ObjectId,
    pub method: String,
    pub args: Vec<Value>,
    /// Branches whose replicated state must be applied before the call runs.
    pub branches: Vec<BranchId>,
}

/// Failure reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub code: ErrorCode,
    pub detail: String,
}

impl RemoteFailure {
    #[must_use]
    pub fn from_error(err: &FabricError) -> Self {
        Self {
            code: err.error_code(),
            detail: err.to_string(),
        }
    }

    #[must_use]
    pub fn into_error(self) -> FabricError {
        match self.code {
            ErrorCode::Validation => FabricError::Validation {
                detail: self.detail,
            },
            ErrorCode::Closed => FabricError::ConnectionClosed { cause: self.detail },
            ErrorCode::Protocol => FabricError::Protocol {
                detail: self.detail,
            },
            code => FabricError::Aborted {
                reason: format!("remote {code:?}: {}", self.detail),
            },
        }
    }
}

/// Outcome carried by a `RESULT` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Returned(Value),
    Failed(RemoteFailure),
    Cancelled,
}

const OUTCOME_RETURNED: u8 = 0;
const OUTCOME_FAILED: u8 = 1;
const OUTCOME_CANCELLED: u8 = 2;

#[derive(Debug, Clone)]
pub enum Frame {
    Heartbeat,
    /// Written last, with [`FrameFlags::EOF`].
    Close {
        cause: String,
    },
    Hello(Hello),
    HelloAck {
        version: u16,
        site: SiteId,
    },
    Map(Arc<VersionMap>),
    InterceptionEnd {
        branch: BranchId,
        interception: InterceptionId,
    },
    Ack {
        branch: BranchId,
        interception: InterceptionId,
    },
    Nack {
        branch: BranchId,
        interception: InterceptionId,
        code: ErrorCode,
        cause: String,
    },
    Call(CallRequest),
    Result {
        call: CallId,
        outcome: CallOutcome,
    },
    Cancel {
        call: CallId,
    },
    DgcReference {
        object: ObjectId,
    },
    DgcRelease {
        object: ObjectId,
    },
}

impl Frame {
    #[must_use]
    pub const fn command(&self) -> u8 {
        match self {
            Self::Heartbeat => command::HEARTBEAT,
            Self::Close { .. } => command::CLOSE,
            Self::Hello(_) => command::HELLO,
            Self::HelloAck { .. } => command::HELLO_ACK,
            Self::Map(_) => command::MAP,
            Self::InterceptionEnd { .. } => command::INTERCEPTION_END,
            Self::Ack { .. } => command::ACK,
            Self::Nack { .. } => command::NACK,
            Self::Call(_) => command::CALL,
            Self::Result { .. } => command::RESULT,
            Self::Cancel { .. } => command::CANCEL,
            Self::DgcReference { .. } => command::DGC_REFERENCE,
            Self::DgcRelease { .. } => command::DGC_RELEASE,
        }
    }

    /// Branch the frame belongs to, for frames that carry one.
    #[must_use]
    pub fn branch(&self) -> Option<BranchId> {
        match self {
            Self::Map(map) => Some(map.branch()),
            Self::InterceptionEnd { branch, .. }
            | Self::Ack { branch, .. }
            | Self::Nack { branch, .. } => Some(*branch),
            _ => None,
        }
    }

    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        match self {
            Self::Close { .. } => FrameFlags::EOF,
            _ => FrameFlags::empty(),
        }
    }
}

// ---------------------------------------------------------------------------
// Control bodies
// ---------------------------------------------------------------------------

fn stage_str(w: &mut ScalarWriter, s: &str) -> Result<()> {
    stage_value(w, &Value::Str(s.to_owned()))
}

fn stage_count(w: &mut ScalarWriter, n: usize) -> Result<()> {
    w.put_u32(u32::try_from(n).map_err(|_| FabricError::protocol(format!("{n} items do not fit a frame")))?);
    Ok(())
}

fn encode_body(frame: &Frame) -> Result<Vec<u8>> {
    let mut w = ScalarWriter::new();
    match frame {
        Frame::Heartbeat | Frame::Map(_) => {}
        Frame::Close { cause } => stage_str(&mut w, cause)?,
        Frame::Hello(hello) => {
            w.put_u16(hello.version);
            w.put_bytes(hello.site.as_bytes());
            stage_count(&mut w, hello.distances.len())?;
            for (branch, distance) in &hello.distances {
                w.put_u64(branch.get());
                w.put_u32(*distance);
            }
        }
        Frame::HelloAck { version, site } => {
            w.put_u16(*version);
            w.put_bytes(site.as_bytes());
        }
        Frame::InterceptionEnd {
            branch,
            interception,
        }
        | Frame::Ack {
            branch,
            interception,
        } => {
            w.put_u64(branch.get());
            w.put_u64(interception.get());
        }
        Frame::Nack {
            branch,
            interception,
            code,
            cause,
        } => {
            w.put_u64(branch.get());
            w.put_u64(interception.get());
            w.put_u8(*code as u8);
            stage_str(&mut w, cause)?;
        }
        Frame::Call(request) => {
            w.put_u64(request.call.get());
            w.put_u64(request.object.get());
            stage_str(&mut w, &request.method)?;
            stage_count(&mut w, request.args.len())?;
            for arg in &request.args {
                stage_value(&mut w, arg)?;
            }
            stage_count(&mut w, request.branches.len())?;
            for branch in &request.branches {
                w.put_u64(branch.get());
            }
        }
        Frame::Result { call, outcome } => {
            w.put_u64(call.get());
            match outcome {
                CallOutcome::Returned(value) => {
                    w.put_u8(OUTCOME_RETURNED);
                    stage_value(&mut w, value)?;
                }
                CallOutcome::Failed(failure) => {
                    w.put_u8(OUTCOME_FAILED);
                    w.put_u8(failure.code as u8);
                    stage_str(&mut w, &failure.detail)?;
                }
                CallOutcome::Cancelled => w.put_u8(OUTCOME_CANCELLED),
            }
        }
        Frame::Cancel { call } => w.put_u64(call.get()),
        Frame::DgcReference { object } | Frame::DgcRelease { object } => w.put_u64(object.get()),
    }
    Ok(w.take_staged())
}

/// Cursor over a fully received control body.
struct Body {
    input: InBuf,
    scalar: ScalarReader,
    values: ValueReader,
    command: u8,
}

impl Body {
    fn truncated(&self) -> FabricError {
        FabricError::protocol(format!("truncated body for command {}", self.command))
    }

    fn u8(&mut self) -> Result<u8> {
        self.scalar.u8(&mut self.input).ok_or_else(|| self.truncated())
    }

    fn u16(&mut self) -> Result<u16> {
        self.scalar.u16(&mut self.input).ok_or_else(|| self.truncated())
    }

    fn u32(&mut self) -> Result<u32> {
        self.scalar.u32(&mut self.input).ok_or_else(|| self.truncated())
    }

    fn u64(&mut self) -> Result<u64> {
        self.scalar.u64(&mut self.input).ok_or_else(|| self.truncated())
    }

    fn site(&mut self) -> Result<SiteId> {
        let bytes = self
            .scalar
            .fixed::<16>(&mut self.input)
            .ok_or_else(|| self.truncated())?;
        Ok(SiteId::from_bytes(bytes))
    }

    fn value(&mut self) -> Result<Value> {
        self.values
            .read(&mut self.input)?
            .ok_or_else(|| self.truncated())
    }

    fn string(&mut self) -> Result<String> {
        match self.value()? {
            Value::Str(s) => Ok(s),
            other => Err(FabricError::protocol(format!(
                "expected a string, got {}",
                other.kind_name()
            ))),
        }
    }

    fn id<T>(&mut self, make: fn(u64) -> Option<T>, what: &str) -> Result<T> {
        let raw = self.u64()?;
        make(raw).ok_or_else(|| FabricError::protocol(format!("{what} id 0")))
    }

    fn code(&mut self) -> Result<ErrorCode> {
        let raw = self.u8()?;
        ErrorCode::from_u8(raw).ok_or_else(|| FabricError::protocol(format!("unknown error code {raw}")))
    }

    /// Bound a count by the bytes left, so a forged count cannot reserve
    /// unbounded memory.
    fn count(&mut self, min_item_len: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        if n.saturating_mul(min_item_len) > self.input.remaining() {
            return Err(self.truncated());
        }
        Ok(n)
    }

    fn finish(self) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(FabricError::protocol(format!(
                "{} trailing bytes after command {}",
                self.input.remaining(),
                self.command
            )))
        }
    }
}

fn decode_body(command: u8, bytes: Vec<u8>, max_string_len: u32) -> Result<Frame> {
    let mut b = Body {
        input: InBuf::from(bytes),
        scalar: ScalarReader::new(),
        values: ValueReader::new(max_string_len),
        command,
    };
    let frame = match command {
        command::HEARTBEAT => Frame::Heartbeat,
        command::CLOSE => Frame::Close { cause: b.string()? },
        command::HELLO => {
            let version = b.u16()?;
            let site = b.site()?;
            let n = b.count(12)?;
            let mut distances = Vec::with_capacity(n);
            for _ in 0..n {
                let branch = b.id(BranchId::new, "branch")?;
                distances.push((branch, b.u32()?));
            }
            Frame::Hello(Hello {
                version,
                site,
                distances,
            })
        }
        command::HELLO_ACK => Frame::HelloAck {
            version: b.u16()?,
            site: b.site()?,
        },
        command::INTERCEPTION_END | command::ACK => {
            let branch = b.id(BranchId::new, "branch")?;
            let interception = b.id(InterceptionId::new, "interception")?;
            if command == command::ACK {
                Frame::Ack {
                    branch,
                    interception,
                }
            } else {
                Frame::InterceptionEnd {
                    branch,
                    interception,
                }
            }
        }
        command::NACK => Frame::Nack {
            branch: b.id(BranchId::new, "branch")?,
            interception: b.id(InterceptionId::new, "interception")?,
            code: b.code()?,
            cause: b.string()?,
        },
        command::CALL => {
            let call = b.id(CallId::new, "call")?;
            let object = b.id(ObjectId::new, "object")?;
            let method = b.string()?;
            let n = b.count(1)?;
            let mut args = Vec::with_capacity(n);
            for _ in 0..n {
                args.push(b.value()?);
            }
            let n = b.count(8)?;
            let mut branches = Vec::with_capacity(n);
            for _ in 0..n {
                branches.push(b.id(BranchId::new, "branch")?);
            }
            Frame::Call(CallRequest {
                call,
                object,
                method,
                args,
                branches,
            })
        }
        command::RESULT => {
            let call = b.id(CallId::new, "call")?;
            let outcome = match b.u8()? {
                OUTCOME_RETURNED => CallOutcome::Returned(b.value()?),
                OUTCOME_FAILED => CallOutcome::Failed(RemoteFailure {
                    code: b.code()?,
                    detail: b.string()?,
                }),
                OUTCOME_CANCELLED => CallOutcome::Cancelled,
                other => {
                    return Err(FabricError::protocol(format!("unknown call outcome {other}")));
                }
            };
            Frame::Result { call, outcome }
        }
        command::CANCEL => Frame::Cancel {
            call: b.id(CallId::new, "call")?,
        },
        command::DGC_REFERENCE => Frame::DgcReference {
            object: b.id(ObjectId::new, "object")?,
        },
        command::DGC_RELEASE => Frame::DgcRelease {
            object: b.id(ObjectId::new, "object")?,
        },
        other => return Err(command::unknown(other)),
    };
    b.finish()?;
    Ok(frame)
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Active {
    /// Fully staged; done once drained.
    Control,
    Map(MapWriter),
}

/// Outbound half of a connection: a queue of frames written in order.
#[derive(Debug, Default)]
pub struct FrameWriter {
    queue: VecDeque<Frame>,
    active: Option<Active>,
    scalar: ScalarWriter,
}

impl FrameWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    /// Frames queued or partly written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Write queued frames into `out` until the queue is empty or `out` is
    /// full. `known` holds the objects whose header the peer already has.
    pub fn write(
        &mut self,
        out: &mut OutBuf,
        known: &mut HashSet<ObjectId>,
        resolver: &dyn ObjectResolver,
    ) -> Result<Progress> {
        loop {
            match &mut self.active {
                None => {
                    let Some(frame) = self.queue.pop_front() else {
                        return Ok(Progress::Complete);
                    };
                    self.scalar.put_u8(frame.flags().bits());
                    self.scalar.put_u8(frame.command());
                    self.active = Some(match frame {
                        Frame::Map(map) => Active::Map(MapWriter::new(map)),
                        control => {
                            let body = encode_body(&control)?;
                            stage_count(&mut self.scalar, body.len())?;
                            self.scalar.put_bytes(&body);
                            Active::Control
                        }
                    });
                }
                Some(Active::Control) => {
                    if !self.scalar.drain_into(out) {
                        return Ok(Progress::Suspended);
                    }
                    self.active = None;
                }
                Some(Active::Map(writer)) => {
                    match writer.write(&mut self.scalar, out, known, resolver)? {
                        Progress::Suspended => return Ok(Progress::Suspended),
                        Progress::Complete => self.active = None,
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ReadStep {
    Flags,
    Command { flags: FrameFlags },
    Length { command: u8 },
    Body { command: u8, len: usize, buf: Vec<u8> },
    Map(Box<MapReader>),
}

/// Inbound half of a connection.
#[derive(Debug)]
pub struct FrameReader {
    source: ConnectionId,
    config: WireConfig,
    step: ReadStep,
    scalar: ScalarReader,
    eof: bool,
}

impl FrameReader {
    /// Maps decoded here are tagged with `source`.
    #[must_use]
    pub fn new(source: ConnectionId, config: WireConfig) -> Self {
        Self {
            source,
            config,
            step: ReadStep::Flags,
            scalar: ScalarReader::new(),
            eof: false,
        }
    }

    /// Whether the peer's last frame has been read.
    #[must_use]
    pub const fn at_eof(&self) -> bool {
        self.eof
    }

    /// Whether no frame is partially decoded.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.step, ReadStep::Flags) && self.scalar.is_idle()
    }

    /// Decode the next frame; `Ok(None)` when more input is needed.
    pub fn read(
        &mut self,
        input: &mut InBuf,
        resolver: &dyn ObjectResolver,
        known: &mut HashSet<ObjectId>,
    ) -> Result<Option<Frame>> {
        loop {
            match &mut self.step {
                ReadStep::Flags => {
                    if self.eof && !input.is_empty() {
                        return Err(FabricError::protocol("bytes after the final frame"));
                    }
                    let Some(raw) = self.scalar.u8(input) else {
                        return Ok(None);
                    };
                    let flags = FrameFlags::from_bits(raw)
                        .filter(|f| (*f - FrameFlags::EOF).is_empty())
                        .ok_or_else(|| FabricError::protocol(format!("bad frame flags {raw:#04x}")))?;
                    self.step = ReadStep::Command { flags };
                }
                ReadStep::Command { flags } => {
                    let flags = *flags;
                    let Some(command) = self.scalar.u8(input) else {
                        return Ok(None);
                    };
                    command::check(command)?;
                    if flags.contains(FrameFlags::EOF) != (command == command::CLOSE) {
                        return Err(FabricError::protocol(format!(
                            "EOF flag mismatch on command {command}"
                        )));
                    }
                    self.step = if command == command::MAP {
                        ReadStep::Map(Box::new(MapReader::new(self.source, &self.config)))
                    } else {
                        ReadStep::Length { command }
                    };
                }
                ReadStep::Length { command } => {
                    let command = *command;
                    let Some(len) = self.scalar.u32(input) else {
                        return Ok(None);
                    };
                    if len > self.config.max_control_bytes {
                        return Err(FabricError::protocol(format!(
                            "command {command} body of {len} bytes exceeds limit {}",
                            self.config.max_control_bytes
                        )));
                    }
                    let len = len as usize;
                    self.step = ReadStep::Body {
                        command,
                        len,
                        buf: Vec::with_capacity(len.min(4096)),
                    };
                }
                ReadStep::Body { command, len, buf } => {
                    if !ScalarReader::bytes_into(input, buf, *len) {
                        return Ok(None);
                    }
                    let (command, buf) = (*command, std::mem::take(buf));
                    self.step = ReadStep::Flags;
                    let frame = decode_body(command, buf, self.config.max_string_len)?;
                    self.eof = command == command::CLOSE;
                    return Ok(Some(frame));
                }
                ReadStep::Map(reader) => {
                    let Some(map) = reader.read(input, resolver, known)? else {
                        return Ok(None);
                    };
                    self.step = ReadStep::Flags;
                    return Ok(Some(Frame::Map(Arc::new(map))));
                }
            }
        }
    }
}
