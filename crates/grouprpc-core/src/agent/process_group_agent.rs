//! RPC agent over a [`ProcessGroup`].
//!
//! Each agent owns two background tasks:
//!
//! - a **sender** that drains one FIFO outbound queue into the transport, so
//!   frames to a given destination leave in the order they were queued
//!   (replies always precede the final Shutdown);
//! - a **delivery loop** that receives every inbound frame, dispatches
//!   requests and resolves the futures of replies.
//!
//! # Shutdown
//!
//! `join()` stops admitting new requests, waits for its own requests to be
//! answered, then sends Shutdown to every other rank. The delivery loop keeps
//! serving peers until each of them has either sent its own Shutdown or been
//! lost, so a peer that joins later can still get its answers.
//!
//! The drain runs in a task of its own. Dropping a `join()` future only stops
//! that caller from waiting; any later `join()` waits for the same drain.

use super::in_flight::{InFlightTable, Pending};
use super::{AgentState, RpcAgent};
use crate::config::{validate_worker_name, AgentOptions};
use crate::error::Fault;
use crate::functions::Dispatch;
use crate::future::FutureMessage;
use crate::message::{Message, MessageType};
use crate::process_group::{GroupEvent, ProcessGroup};
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum Outbound {
    Send { dst: usize, message: Message },
    /// Acknowledged once everything queued before it has been handed to the
    /// transport.
    Flush(oneshot::Sender<()>),
    Stop,
}

struct Tasks {
    sender: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl Drop for Tasks {
    fn drop(&mut self) {
        // No-op for tasks that already finished.
        self.sender.abort();
        self.delivery.abort();
    }
}

struct Inner {
    name: String,
    rank: usize,
    /// Worker names indexed by rank.
    names: Vec<String>,
    ranks: HashMap<String, usize>,
    group: Arc<dyn ProcessGroup>,
    dispatch: Arc<dyn Dispatch>,
    options: AgentOptions,
    next_id: AtomicU64,
    in_flight: InFlightTable,
    state: watch::Sender<AgentState>,
    /// Raised once this agent has broadcast its Shutdown.
    joined: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Set by the drain task when closing the transport failed.
    close_error: Mutex<Option<String>>,
}

/// RPC agent bound to one rank of a process group.
pub struct ProcessGroupAgent {
    inner: Arc<Inner>,
    tasks: Mutex<Option<Tasks>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    /// One `sync()` round at a time per agent.
    sync_turn: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ProcessGroupAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroupAgent")
            .field("name", &self.inner.name)
            .field("rank", &self.inner.rank)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ProcessGroupAgent {
    /// Start an agent with default options.
    ///
    /// Must be called from within a tokio runtime; the background tasks are
    /// spawned onto it.
    pub fn new(
        self_name: impl Into<String>,
        peer_name_to_rank: HashMap<String, usize>,
        group: Arc<dyn ProcessGroup>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        Self::with_options(
            self_name,
            peer_name_to_rank,
            group,
            dispatch,
            AgentOptions::default(),
        )
    }

    pub fn with_options(
        self_name: impl Into<String>,
        peer_name_to_rank: HashMap<String, usize>,
        group: Arc<dyn ProcessGroup>,
        dispatch: Arc<dyn Dispatch>,
        options: AgentOptions,
    ) -> Result<Self> {
        let name = self_name.into();
        let names = names_by_rank(&name, &peer_name_to_rank, group.as_ref())?;

        if options.rpc_timeout.is_some() && options.timeout_sweep_interval.is_zero() {
            return Err(RpcError::invalid_config(
                "timeout sweep interval must be greater than zero",
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| RpcError::Runtime {
            message: format!("agent '{}' needs a tokio runtime: {}", name, e),
        })?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            rank: group.rank(),
            name,
            names,
            ranks: peer_name_to_rank,
            group,
            dispatch,
            options,
            next_id: AtomicU64::new(1),
            in_flight: InFlightTable::default(),
            state: watch::channel(AgentState::Running).0,
            joined: watch::channel(false).0,
            outbound,
            close_error: Mutex::new(None),
        });

        let sender = runtime.spawn(run_sender(inner.clone(), outbound_rx));
        let delivery = runtime.spawn(run_delivery(inner.clone()));

        info!(
            "Agent '{}' started on rank {} of {}",
            inner.name,
            inner.rank,
            inner.names.len()
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(Some(Tasks { sender, delivery })),
            drain: Mutex::new(None),
            sync_turn: tokio::sync::Mutex::new(()),
        })
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    /// Number of requests sent by this agent that have not resolved yet.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    fn take_tasks(&self) -> Option<Tasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn wait_stopped(&self) {
        let mut state = self.inner.state.subscribe();
        while *state.borrow_and_update() != AgentState::Stopped {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Check the membership map against the group and lay the names out by rank.
fn names_by_rank(
    self_name: &str,
    peer_name_to_rank: &HashMap<String, usize>,
    group: &dyn ProcessGroup,
) -> Result<Vec<String>> {
    let size = group.size();
    if peer_name_to_rank.len() != size {
        return Err(RpcError::invalid_config(format!(
            "{} worker names given for a group of {}",
            peer_name_to_rank.len(),
            size
        )));
    }

    let mut names: Vec<Option<String>> = vec![None; size];
    for (name, &rank) in peer_name_to_rank {
        validate_worker_name(name)?;
        let slot = names.get_mut(rank).ok_or_else(|| {
            RpcError::invalid_config(format!(
                "worker '{}' has rank {} outside the group of {}",
                name, rank, size
            ))
        })?;
        if let Some(other) = slot.as_ref() {
            return Err(RpcError::invalid_config(format!(
                "workers '{}' and '{}' share rank {}",
                other, name, rank
            )));
        }
        *slot = Some(name.clone());
    }

    let own_rank = peer_name_to_rank.get(self_name).copied().ok_or_else(|| {
        RpcError::invalid_config(format!("own name '{}' is not a group member", self_name))
    })?;
    if own_rank != group.rank() {
        return Err(RpcError::invalid_config(format!(
            "'{}' maps to rank {} but the group handle is rank {}",
            self_name,
            own_rank,
            group.rank()
        )));
    }

    // Every slot is filled: the map has `size` entries with distinct ranks.
    Ok(names.into_iter().flatten().collect())
}

impl Inner {
    fn close_error(&self) -> Option<String> {
        self.close_error
            .lock()
            .ok()
            .and_then(|close_error| close_error.clone())
    }

    fn peer_name(&self, rank: usize) -> String {
        self.names
            .get(rank)
            .cloned()
            .unwrap_or_else(|| format!("rank {}", rank))
    }

    fn enqueue(&self, dst: usize, message: Message) -> bool {
        self.outbound.send(Outbound::Send { dst, message }).is_ok()
    }

    /// Wait until the sender has passed everything queued so far.
    async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn fail(&self, pending: Vec<Pending>, message: &str) {
        for entry in pending {
            let peer = self.peer_name(entry.destination);
            self.in_flight.settle(
                entry,
                Err(Fault::Transport {
                    peer,
                    message: message.to_string(),
                }),
            );
        }
    }

    fn handle_frame(&self, src: usize, data: Bytes, departed: &mut HashSet<usize>) {
        let message = match Message::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Agent '{}' discarding undecodable frame from rank {}: {}",
                    self.name, src, e
                );
                return;
            }
        };

        match message.kind() {
            MessageType::Request => self.serve(src, message),
            MessageType::Response | MessageType::Exception => self.complete(src, message),
            MessageType::Shutdown => {
                debug!("Agent '{}' saw shutdown from '{}'", self.name, self.peer_name(src));
                departed.insert(src);
            }
        }
    }

    fn serve(&self, src: usize, request: Message) {
        let id = request.id();
        let operation = request.operation();
        debug!(
            "Agent '{}' dispatching '{}' (id {}) from '{}'",
            self.name,
            operation,
            id,
            self.peer_name(src)
        );

        let payload = request.payload().clone();
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch.dispatch(operation, payload)));
        let reply = match outcome {
            Ok(Ok(result)) => Message::response(id, operation, result),
            Ok(Err(e)) => Message::exception(id, operation, e.to_string()),
            Err(_) => {
                error!("Operation '{}' panicked on agent '{}'", operation, self.name);
                Message::exception(id, operation, "operation panicked")
            }
        };

        if !self.enqueue(src, reply) {
            warn!(
                "Agent '{}' dropped reply to '{}' (id {}): sender stopped",
                self.name,
                self.peer_name(src),
                id
            );
        }
    }

    fn complete(&self, src: usize, reply: Message) {
        let Some(pending) = self.in_flight.take_reply(reply.id(), src) else {
            warn!(
                "Agent '{}' discarding {} (id {}) from '{}': no matching request",
                self.name,
                reply.kind(),
                reply.id(),
                self.peer_name(src)
            );
            return;
        };

        debug!(
            "Agent '{}' received {} for id {}",
            self.name,
            reply.kind(),
            reply.id()
        );
        let outcome = match reply.exception_text() {
            Some(text) => Err(Fault::Dispatch {
                operation: reply.operation().to_string(),
                message: text,
            }),
            None => Ok(reply),
        };
        self.in_flight.settle(pending, outcome);
    }

    fn handle_peer_lost(&self, rank: usize, reason: &str, departed: &mut HashSet<usize>) {
        let peer = self.peer_name(rank);
        let pending = self.in_flight.take_to(rank);
        warn!(
            "Agent '{}' lost peer '{}' ({}); failing {} request(s)",
            self.name,
            peer,
            reason,
            pending.len()
        );
        self.fail(pending, &format!("peer lost: {}", reason));
        departed.insert(rank);
    }

    fn expire(&self, timeout: Duration) {
        for entry in self.in_flight.take_expired(timeout) {
            warn!(
                "Agent '{}' request to '{}' timed out after {:?}",
                self.name,
                self.peer_name(entry.destination),
                timeout
            );
            self.in_flight.settle(entry, Err(Fault::Timeout { after: timeout }));
        }
    }
}

async fn run_sender(inner: Arc<Inner>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Send { dst, message } => {
                if let Err(e) = inner.group.send(dst, message.encode()).await {
                    warn!(
                        "Agent '{}' failed to send {} (id {}) to '{}': {}",
                        inner.name,
                        message.kind(),
                        message.id(),
                        inner.peer_name(dst),
                        e
                    );
                    if message.kind() == MessageType::Request {
                        if let Some(pending) = inner.in_flight.take(message.id()) {
                            inner.fail(vec![pending], &format!("send failed: {}", e));
                        }
                    }
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
            Outbound::Stop => break,
        }
    }
    debug!("Agent '{}' sender stopped", inner.name);
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_delivery(inner: Arc<Inner>) {
    let peers = inner.names.len() - 1;
    let mut departed: HashSet<usize> = HashSet::new();
    let mut joined = inner.joined.subscribe();
    let mut sweep = inner.options.rpc_timeout.map(|_| {
        let mut interval = tokio::time::interval(inner.options.timeout_sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        if *joined.borrow_and_update() && departed.len() >= peers {
            debug!("Agent '{}' delivery loop done: all peers departed", inner.name);
            break;
        }

        tokio::select! {
            event = inner.group.recv_any() => match event {
                Some(GroupEvent::Frame { src, data }) => {
                    inner.handle_frame(src, data, &mut departed);
                }
                Some(GroupEvent::PeerLost { rank, reason }) => {
                    if rank != inner.rank {
                        inner.handle_peer_lost(rank, &reason, &mut departed);
                    }
                }
                None => {
                    let pending = inner.in_flight.take_all();
                    warn!(
                        "Agent '{}' transport closed; failing {} request(s)",
                        inner.name,
                        pending.len()
                    );
                    inner.fail(pending, "transport closed");
                    break;
                }
            },
            changed = joined.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = next_sweep(&mut sweep) => {
                if let Some(timeout) = inner.options.rpc_timeout {
                    inner.expire(timeout);
                }
            }
        }
    }
}

#[async_trait]
impl RpcAgent for ProcessGroupAgent {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> AgentState {
        *self.inner.state.borrow()
    }

    fn worker_names(&self) -> Vec<String> {
        self.inner.names.clone()
    }

    fn invoke_async(
        &self,
        destination: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<FutureMessage> {
        let dst = *self
            .inner
            .ranks
            .get(destination)
            .ok_or_else(|| RpcError::UnknownDestination {
                name: destination.to_string(),
            })?;

        // Holding the state borrow keeps `join` from moving to Draining
        // between the check and the enqueue.
        let state = self.inner.state.borrow();
        if *state != AgentState::Running {
            return Err(RpcError::ShuttingDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let future = FutureMessage::new();
        self.inner.in_flight.insert(id, dst, future.clone());
        if !self.inner.enqueue(dst, Message::request(id, operation, payload)) {
            self.inner.in_flight.forget(id);
            return Err(RpcError::ShuttingDown);
        }
        drop(state);

        debug!(
            "Agent '{}' invoked '{}' on '{}' (id {})",
            self.inner.name, operation, destination, id
        );
        Ok(future)
    }

    async fn sync(&self) -> Result<()> {
        let _turn = self.sync_turn.lock().await;
        if self.state() == AgentState::Stopped {
            return Err(RpcError::ShuttingDown);
        }
        self.inner.group.barrier().await?;
        self.inner.flush().await;
        self.inner.in_flight.wait_idle().await;
        self.inner.group.barrier().await
    }

    async fn join(&self) -> Result<()> {
        let first = self.inner.state.send_if_modified(|state| {
            if *state == AgentState::Running {
                *state = AgentState::Draining;
                true
            } else {
                false
            }
        });
        if first {
            let drain = tokio::spawn(drain_and_stop(self.inner.clone(), self.take_tasks()));
            *self
                .drain
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(drain);
        }

        self.wait_stopped().await;
        match self.inner.close_error() {
            Some(message) => Err(RpcError::Transport { message }),
            None => Ok(()),
        }
    }
}

/// Shutdown sequence started by the first `join()`. Ends in `Stopped`.
async fn drain_and_stop(inner: Arc<Inner>, tasks: Option<Tasks>) {
    info!(
        "Agent '{}' draining {} request(s)",
        inner.name,
        inner.in_flight.len()
    );
    inner.flush().await;
    inner.in_flight.wait_idle().await;

    for rank in (0..inner.names.len()).filter(|&rank| rank != inner.rank) {
        inner.enqueue(rank, Message::shutdown());
    }
    inner.joined.send_replace(true);

    if let Some(mut tasks) = tasks {
        if let Err(e) = (&mut tasks.delivery).await {
            error!("Agent '{}' delivery loop failed: {}", inner.name, e);
        }
        let _ = inner.outbound.send(Outbound::Stop);
        if let Err(e) = (&mut tasks.sender).await {
            error!("Agent '{}' sender failed: {}", inner.name, e);
        }
    }

    inner.fail(inner.in_flight.take_all(), "agent stopped");
    if let Err(e) = inner.group.close().await {
        warn!("Agent '{}' failed to close its group: {}", inner.name, e);
        if let Ok(mut close_error) = inner.close_error.lock() {
            *close_error = Some(e.to_string());
        }
    }
    inner.state.send_replace(AgentState::Stopped);
    info!("Agent '{}' stopped", inner.name);
}

impl Drop for ProcessGroupAgent {
    fn drop(&mut self) {
        let drain = match self.drain.get_mut() {
            Ok(drain) => drain.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(drain) = drain {
            drain.abort();
        }
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => tasks.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tasks);

        if *self.inner.state.borrow() != AgentState::Stopped {
            debug!("Agent '{}' dropped before join finished", self.inner.name);
            self.inner
                .fail(self.inner.in_flight.take_all(), "agent dropped");
        }
    }
}
