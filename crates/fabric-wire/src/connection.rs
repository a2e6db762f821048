//! One end of a peer connection.
//!
//! A [`Connection`] owns no socket. The driver feeds it received bytes with
//! [`Connection::on_bytes`] and asks it for bytes to send with
//! [`Connection::poll_write`]; both return as soon as they run out of input
//! or output space and resume exactly where they stopped.
//!
//! Outbound, the connection walks the branches it shares with the peer and
//! queues their maps, followed by an `INTERCEPTION_END` whenever it gates
//! commits on the peer. Inbound, maps that belong to an interception are
//! held until its end marker arrives, reviewed by the local [`Authority`],
//! then applied and acknowledged (or refused with a `NACK`).
//!
//! Calls are released to the wire only once the branches they depend on
//! are fully replicated, and run on the callee only once nothing is held
//! back for those branches.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use fabric_bits::guarded;
use fabric_error::{FabricError, Result};
use fabric_mvcc::observability::{emit, now_ns};
use fabric_mvcc::{
    AckSlot, Branch, Interceptor, Outbound, SharedObserver, Site, TObject, VersionMap, Walker,
};
use fabric_observability::FabricEvent;
use fabric_types::{BranchId, ConnectionId, InterceptionId, ObjectId, Value};

use crate::buf::{InBuf, OutBuf, Progress};
use crate::call::{CallFuture, CallHandler, CallQueue, CallTable, NoHandler};
use crate::config::WireConfig;
use crate::controller::Controller;
use crate::dgc::RemoteReferences;
use crate::frame::{CallOutcome, CallRequest, Frame, FrameReader, FrameWriter, RemoteFailure};
use crate::heartbeat::{HeartbeatAction, HeartbeatTimer};
use crate::observability::{
    record_bytes_read, record_bytes_written, record_connection_closed, record_frame_read,
    record_heartbeat_sent, record_overload_transition, record_protocol_violation,
    record_read_suspension, record_validator_rejection, record_write_suspension,
};
use crate::validator::{self, AllowAll, Validator};

// ---------------------------------------------------------------------------
// Boundaries
// ---------------------------------------------------------------------------

/// Decides whether the maps of one incoming interception are accepted.
pub trait Authority: Send + Sync {
    fn review(
        &self,
        connection: ConnectionId,
        branch: BranchId,
        maps: &[Arc<VersionMap>],
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Authority for AcceptAll {
    fn review(&self, _: ConnectionId, _: BranchId, _: &[Arc<VersionMap>]) -> Result<()> {
        Ok(())
    }
}

/// How local commits on shared branches relate to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Forward maps; commits never wait for the peer.
    #[default]
    Relay,
    /// The peer is an authority: commits wait for its `ACK`.
    Intercept,
}

pub type OverloadCallback = Box<dyn Fn(bool) + Send + Sync>;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Outbound replication state, created with the first shared branch.
struct Replication {
    slot: AckSlot,
    interceptor: Interceptor,
    walker: Walker,
    branches: Vec<Arc<Branch>>,
}

pub struct Connection {
    id: ConnectionId,
    site: Arc<Site>,
    config: WireConfig,
    observer: SharedObserver,
    validator: Arc<dyn Validator>,
    handler: Arc<dyn CallHandler>,
    authority: Arc<dyn Authority>,
    mode: ReplicationMode,
    on_overload: Option<OverloadCallback>,

    controller: Controller,
    heartbeat: HeartbeatTimer,
    writer: FrameWriter,
    reader: FrameReader,
    input: InBuf,
    /// Objects whose header the peer has from us.
    sent_headers: HashSet<ObjectId>,
    /// Objects whose header we have from the peer.
    received_headers: HashSet<ObjectId>,

    replication: Option<Replication>,
    held: HashMap<(BranchId, InterceptionId), Vec<Arc<VersionMap>>>,
    /// Maps across all of `held`.
    held_maps: usize,

    calls: Arc<CallTable>,
    outgoing: CallQueue,
    incoming: CallQueue,
    references: RemoteReferences,
    collectable: Vec<ObjectId>,

    overloaded: bool,
    closed: Option<String>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("site", &self.site.id())
            .field("mode", &self.mode)
            .field("peer", &self.controller.peer())
            .field("pending_sends", &self.writer.pending())
            .field("pending_calls", &self.calls.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, site: Arc<Site>, config: WireConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            controller: Controller::new(site.id()),
            site,
            config,
            observer: None,
            validator: Arc::new(AllowAll),
            handler: Arc::new(NoHandler),
            authority: Arc::new(AcceptAll),
            mode: ReplicationMode::Relay,
            on_overload: None,
            heartbeat: HeartbeatTimer::new(&config, now),
            writer: FrameWriter::new(),
            reader: FrameReader::new(id, config),
            input: InBuf::new(),
            sent_headers: HashSet::new(),
            received_headers: HashSet::new(),
            replication: None,
            held: HashMap::new(),
            held_maps: 0,
            calls: Arc::new(CallTable::new()),
            outgoing: CallQueue::new(),
            incoming: CallQueue::new(),
            references: RemoteReferences::new(),
            collectable: Vec::new(),
            overloaded: false,
            closed: None,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.handler = handler;
        self
    }

    #[must_use]
    pub fn with_authority(mut self, authority: Arc<dyn Authority>) -> Self {
        self.authority = authority;
        self
    }

    /// Must be chosen before the first [`Connection::share_branch`].
    #[must_use]
    pub fn with_replication(mut self, mode: ReplicationMode) -> Self {
        self.mode = mode;
        self
    }

    /// `callback(true)` once pending sends reach the overload threshold,
    /// `callback(false)` once they drain below half of it.
    #[must_use]
    pub fn on_overload(mut self, callback: OverloadCallback) -> Self {
        self.on_overload = Some(callback);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }

    #[must_use]
    pub const fn controller(&self) -> &Controller {
        &self.controller
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    #[must_use]
    pub fn close_cause(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    /// Frames queued or partly written.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.writer.pending()
    }

    #[must_use]
    pub const fn is_overloaded(&self) -> bool {
        self.overloaded
    }

    #[must_use]
    pub fn calls(&self) -> &Arc<CallTable> {
        &self.calls
    }

    /// Incoming interceptions waiting for their end marker.
    #[must_use]
    pub fn held_interceptions(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn remote_references(&self) -> &RemoteReferences {
        &self.references
    }

    /// Objects the peer stopped referencing since the last call.
    pub fn take_collectable(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.collectable)
    }

    /// Whether the connection has nothing left to send or run.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.writer.is_idle()
            && self.outgoing.is_empty()
            && self.incoming.is_empty()
            && self
                .replication
                .as_ref()
                .is_none_or(|r| r.branches.iter().all(|b| r.walker.is_up_to_date(b)))
    }

    // -----------------------------------------------------------------------
    // Outbound API
    // -----------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        match &self.closed {
            Some(cause) => Err(FabricError::closed(cause.clone())),
            None => Ok(()),
        }
    }

    /// Queue the controller `HELLO`.
    pub fn hello(&mut self) -> Result<()> {
        self.ensure_open()?;
        let hello = self.controller.hello(&self.site);
        self.writer.push(hello);
        self.update_pressure();
        Ok(())
    }

    /// Start replicating `branch` to the peer.
    pub fn share_branch(&mut self, branch: &Arc<Branch>) -> Result<()> {
        self.ensure_open()?;
        if self.replication.is_none() {
            let slot = self.site.allocate_ack_slot()?;
            let interceptor = match self.mode {
                ReplicationMode::Intercept => Interceptor::new(slot, Some(self.id)),
                ReplicationMode::Relay => Interceptor::relay(slot, Some(self.id)),
            }
            .with_limit(self.config.overload_threshold as usize);
            self.replication = Some(Replication {
                slot,
                interceptor,
                walker: Walker::new(Some(slot), self.site.config()),
                branches: Vec::new(),
            });
        }
        let Some(replication) = self.replication.as_mut() else {
            return Err(FabricError::internal("replication state missing"));
        };
        if replication.branches.iter().any(|b| b.id() == branch.id()) {
            return Ok(());
        }
        replication.interceptor.attach(branch)?;
        replication.branches.push(Arc::clone(branch));
        tracing::debug!(
            connection = %self.id,
            branch = %branch.id(),
            mode = ?self.mode,
            "branch shared"
        );
        Ok(())
    }

    /// Stop replicating `branch`. Returns whether it was shared.
    pub fn unshare_branch(&mut self, branch: BranchId) -> Result<bool> {
        let Some(replication) = self.replication.as_mut() else {
            return Ok(false);
        };
        let Some(at) = replication.branches.iter().position(|b| b.id() == branch) else {
            return Ok(false);
        };
        let removed = replication.branches.remove(at);
        replication.interceptor.detach(&removed)?;
        replication.walker.forget(branch);
        Ok(true)
    }

    /// Invoke `method` on the peer's `object` once `branches` are fully
    /// replicated to it.
    pub fn call(
        &mut self,
        object: ObjectId,
        method: &str,
        args: Vec<Value>,
        branches: Vec<BranchId>,
    ) -> Result<CallFuture> {
        self.ensure_open()?;
        let future = self.calls.register()?;
        tracing::debug!(connection = %self.id, call = %future.id(), %object, method, "call queued");
        self.outgoing.store(CallRequest {
            call: future.id(),
            object,
            method: method.to_owned(),
            args,
            branches,
        });
        Ok(future)
    }

    /// Tell the peer it now holds one more reference to `object`.
    pub fn reference_object(&mut self, object: ObjectId) -> Result<()> {
        self.ensure_open()?;
        self.writer.push(Frame::DgcReference { object });
        self.update_pressure();
        Ok(())
    }

    pub fn release_object(&mut self, object: ObjectId) -> Result<()> {
        self.ensure_open()?;
        self.writer.push(Frame::DgcRelease { object });
        self.update_pressure();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write side
    // -----------------------------------------------------------------------

    /// Produce bytes for the peer into `out`.
    ///
    /// After a close, keeps flushing until the `CLOSE` frame is out.
    pub fn poll_write(&mut self, now: Instant, out: &mut OutBuf) -> Result<Progress> {
        if self.closed.is_none() {
            match self.heartbeat.poll(now) {
                HeartbeatAction::Idle => {}
                HeartbeatAction::SendHeartbeat => {
                    self.writer.push(Frame::Heartbeat);
                    record_heartbeat_sent();
                }
                HeartbeatAction::TimedOut => {
                    let err = FabricError::closed(format!(
                        "no traffic from the peer for {}ms",
                        self.config.timeout_ms
                    ));
                    self.fail(&err);
                }
            }
        }
        if self.closed.is_none() {
            if let Err(err) = self.pump() {
                self.fail(&err);
                return Err(err);
            }
        }

        let before = out.len();
        let progress = match self.writer.write(out, &mut self.sent_headers, &*self.site) {
            Ok(progress) => progress,
            Err(err) => {
                // The frame stream is torn; nothing more can be sent.
                self.writer = FrameWriter::new();
                self.shutdown(&err.to_string());
                return Err(err);
            }
        };
        let written = out.len() - before;
        if written > 0 {
            record_bytes_written(written);
            self.heartbeat.on_write(now);
        }
        if progress == Progress::Suspended {
            record_write_suspension();
        }
        self.update_pressure();
        Ok(progress)
    }

    /// Move replication output, ready calls and cancellations into the
    /// frame queue.
    fn pump(&mut self) -> Result<()> {
        let threshold = self.config.overload_threshold as usize;
        if let Some(replication) = self.replication.as_mut() {
            if self.writer.pending() < threshold {
                replication
                    .walker
                    .run(&replication.branches, &mut replication.interceptor)?;
                for item in replication.interceptor.drain() {
                    match item {
                        Outbound::Map { map, .. } => {
                            let map = if self.mode == ReplicationMode::Relay
                                && map.interception().is_some()
                            {
                                Arc::new(map.with_position(map.seq(), map.txn(), None))
                            } else {
                                map
                            };
                            self.writer.push(Frame::Map(map));
                        }
                        Outbound::End {
                            branch,
                            interception,
                        } => self.writer.push(Frame::InterceptionEnd {
                            branch,
                            interception,
                        }),
                    }
                }
            }
        }

        let lagging: HashSet<BranchId> = self
            .replication
            .as_ref()
            .map(|r| {
                r.branches
                    .iter()
                    .filter(|b| !r.walker.is_up_to_date(b))
                    .map(|b| b.id())
                    .collect()
            })
            .unwrap_or_default();
        while let Some(request) = self
            .outgoing
            .next_ready(|r| r.branches.iter().all(|b| !lagging.contains(b)))
        {
            self.writer.push(Frame::Call(request));
        }

        for call in self.calls.take_cancellations() {
            if self.outgoing.cancel(call) {
                continue;
            }
            self.writer.push(Frame::Cancel { call });
        }
        Ok(())
    }

    fn update_pressure(&mut self) {
        let pending = self.writer.pending();
        let threshold = self.config.overload_threshold as usize;
        let overloaded = if self.overloaded {
            pending >= threshold / 2
        } else {
            pending >= threshold
        };
        if overloaded == self.overloaded {
            return;
        }
        self.overloaded = overloaded;
        record_overload_transition();
        tracing::info!(connection = %self.id, overloaded, pending, "send pressure changed");
        emit(
            &self.observer,
            &FabricEvent::Overload {
                connection: self.id,
                overloaded,
                pending: pending as u64,
                timestamp_ns: now_ns(),
            },
        );
        if let Some(callback) = &self.on_overload {
            callback(overloaded);
        }
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    /// Consume bytes from the peer. An error has already closed the
    /// connection.
    pub fn on_bytes(&mut self, now: Instant, bytes: &[u8]) -> Result<()> {
        if self.closed.is_some() {
            return Ok(());
        }
        if !bytes.is_empty() {
            record_bytes_read(bytes.len());
            self.heartbeat.on_read(now);
            self.input.feed(bytes);
        }
        loop {
            let frame = match self
                .reader
                .read(&mut self.input, &*self.site, &mut self.received_headers)
            {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if !self.reader.is_idle() {
                        record_read_suspension();
                    }
                    break;
                }
                Err(err) => {
                    self.fail(&err);
                    return Err(err);
                }
            };
            record_frame_read();
            if let Err(err) = self.handle(frame) {
                self.fail(&err);
                return Err(err);
            }
            if self.closed.is_some() {
                return Ok(());
            }
        }
        self.run_ready_calls();
        self.update_pressure();
        Ok(())
    }

    fn handle(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Heartbeat => {}
            Frame::Close { cause } => {
                tracing::info!(connection = %self.id, %cause, "peer closed the connection");
                self.shutdown(&format!("closed by peer: {cause}"));
            }
            Frame::Hello(hello) => {
                let ack = self.controller.on_hello(&hello, &self.site)?;
                self.writer.push(ack);
            }
            Frame::HelloAck { version, site } => self.controller.on_hello_ack(version, site)?,
            Frame::Map(map) => self.on_map(map)?,
            Frame::InterceptionEnd {
                branch,
                interception,
            } => self.on_interception_end(branch, interception),
            Frame::Ack {
                branch,
                interception,
            } => {
                let branch = self.known_branch(branch)?;
                if let Err(err) = Interceptor::ack(&branch, interception) {
                    tracing::debug!(connection = %self.id, %interception, %err, "stale ACK ignored");
                }
            }
            Frame::Nack {
                branch,
                interception,
                code,
                cause,
            } => {
                let branch = self.known_branch(branch)?;
                if let Err(err) = Interceptor::nack(&branch, interception, code, &cause) {
                    tracing::debug!(connection = %self.id, %interception, %err, "stale NACK ignored");
                }
            }
            Frame::Call(request) => {
                let object = self.local_object(request.object)?;
                validator::check(self.validator.validate_method_call(
                    self.id,
                    &object,
                    &request.method,
                ))?;
                self.incoming.store(request);
            }
            Frame::Result { call, outcome } => {
                let result = match outcome {
                    CallOutcome::Returned(value) => Ok(value),
                    CallOutcome::Failed(failure) => Err(failure.into_error()),
                    CallOutcome::Cancelled => Err(FabricError::Cancelled),
                };
                if !self.calls.complete(call, result) {
                    tracing::debug!(connection = %self.id, %call, "result for a finished call dropped");
                }
            }
            Frame::Cancel { call } => {
                if self.incoming.cancel(call) {
                    self.writer.push(Frame::Result {
                        call,
                        outcome: CallOutcome::Cancelled,
                    });
                }
            }
            Frame::DgcReference { object } => {
                let target = self.local_object(object)?;
                validator::check(self.validator.validate_read(self.id, &target))?;
                self.references.reference(object);
            }
            Frame::DgcRelease { object } => {
                if self.references.release(object)? {
                    self.collectable.push(object);
                }
            }
        }
        Ok(())
    }

    fn known_branch(&self, id: BranchId) -> Result<Arc<Branch>> {
        self.site
            .branch(id)
            .ok_or_else(|| FabricError::protocol(format!("acknowledgement for unknown {id}")))
    }

    fn local_object(&self, id: ObjectId) -> Result<Arc<TObject>> {
        self.site
            .object(id)
            .ok_or_else(|| FabricError::protocol(format!("peer referenced unknown {id}")))
    }

    fn on_map(&mut self, map: Arc<VersionMap>) -> Result<()> {
        for object in map.objects() {
            if let Some(target) = self.site.object(object) {
                validator::check(self.validator.validate_write(self.id, &target))?;
            }
        }
        match map.interception() {
            Some(interception) => {
                let key = (map.branch(), interception);
                if !self.held.contains_key(&key)
                    && self.held.len() >= self.config.max_held_interceptions as usize
                {
                    return Err(FabricError::protocol(format!(
                        "peer holds more than {} interceptions open",
                        self.config.max_held_interceptions
                    )));
                }
                if self.held_maps >= self.config.max_held_maps as usize {
                    return Err(FabricError::protocol(format!(
                        "peer holds more than {} intercepted maps",
                        self.config.max_held_maps
                    )));
                }
                self.held.entry(key).or_default().push(map);
                self.held_maps += 1;
            }
            None => {
                self.site.apply_remote(&map)?;
            }
        }
        Ok(())
    }

    fn on_interception_end(&mut self, branch: BranchId, interception: InterceptionId) {
        let maps = self.held.remove(&(branch, interception)).unwrap_or_default();
        self.held_maps -= maps.len();
        let verdict = self
            .authority
            .review(self.id, branch, &maps)
            .and_then(|()| self.site.apply_remote_batch(branch, &maps).map(drop));
        let reply = match verdict {
            Ok(()) => Frame::Ack {
                branch,
                interception,
            },
            Err(err) => {
                tracing::warn!(
                    connection = %self.id,
                    %branch,
                    %interception,
                    %err,
                    "interception refused"
                );
                Frame::Nack {
                    branch,
                    interception,
                    code: err.error_code(),
                    cause: err.to_string(),
                }
            }
        };
        tracing::debug!(
            connection = %self.id,
            %branch,
            %interception,
            maps = maps.len(),
            "interception reviewed"
        );
        self.writer.push(reply);
    }

    /// Run stored calls whose branches have nothing held back.
    fn run_ready_calls(&mut self) {
        let held: HashSet<BranchId> = self.held.keys().map(|(branch, _)| *branch).collect();
        while let Some(request) = self
            .incoming
            .next_ready(|r| r.branches.iter().all(|b| !held.contains(b)))
        {
            let outcome = match self.execute(&request) {
                Ok(value) => CallOutcome::Returned(value),
                Err(err) => {
                    tracing::debug!(connection = %self.id, call = %request.call, %err, "call failed");
                    CallOutcome::Failed(RemoteFailure::from_error(&err))
                }
            };
            self.writer.push(Frame::Result {
                call: request.call,
                outcome,
            });
        }
    }

    fn execute(&self, request: &CallRequest) -> Result<Value> {
        let object = self.local_object(request.object)?;
        let handler = Arc::clone(&self.handler);
        guarded(|| handler.invoke(&object, &request.method, &request.args))?
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Close the connection: a `CLOSE` frame is queued for the peer and all
    /// local state tied to the peer is released.
    pub fn close(&mut self, cause: &str) {
        if self.closed.is_some() {
            return;
        }
        self.writer.push(Frame::Close {
            cause: cause.to_owned(),
        });
        self.shutdown(cause);
    }

    fn fail(&mut self, err: &FabricError) {
        if self.closed.is_some() {
            return;
        }
        match err {
            FabricError::Validation { detail } => {
                record_validator_rejection();
                emit(
                    &self.observer,
                    &FabricEvent::ValidatorRejected {
                        connection: self.id,
                        detail: detail.clone(),
                        timestamp_ns: now_ns(),
                    },
                );
            }
            _ if err.is_fatal_to_connection() => record_protocol_violation(),
            _ => {}
        }
        tracing::warn!(connection = %self.id, %err, "connection failed");
        self.close(&err.to_string());
    }

    fn shutdown(&mut self, cause: &str) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(cause.to_owned());
        let failed_calls = self.calls.fail_all(&FabricError::closed(cause));
        self.outgoing.drain().for_each(drop);
        self.incoming.drain().for_each(drop);
        self.held.clear();
        self.held_maps = 0;

        if let Some(replication) = self.replication.take() {
            for branch in &replication.branches {
                if replication.interceptor.is_gating() {
                    if let Err(err) = branch.disconnect(cause) {
                        tracing::warn!(branch = %branch.id(), %err, "disconnect failed");
                    }
                }
                if let Err(err) = replication.interceptor.detach(branch) {
                    tracing::warn!(branch = %branch.id(), %err, "detach failed");
                }
            }
            self.site.release_ack_slot(replication.slot);
        }
        self.collectable.extend(self.references.drain());

        record_connection_closed(failed_calls);
        tracing::info!(
            connection = %self.id,
            cause,
            failed_calls,
            "connection closed"
        );
        emit(
            &self.observer,
            &FabricEvent::ConnectionClosed {
                connection: self.id,
                cause: cause.to_owned(),
                failed_calls,
                timestamp_ns: now_ns(),
            },
        );
    }
}
