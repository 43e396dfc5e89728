//! RPC agents: named participants that call operations on each other.
//!
//! [`RpcAgent`] is the capability surface shared by every transport;
//! [`ProcessGroupAgent`] is the implementation over a
//! [`ProcessGroup`](crate::process_group::ProcessGroup).

mod in_flight;
pub mod process_group_agent;

pub use process_group_agent::ProcessGroupAgent;

use crate::future::FutureMessage;
use crate::message::Message;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Lifecycle of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Accepting and servicing RPCs.
    Running,
    /// `join()` in progress: new RPCs are rejected, in-flight ones finish.
    Draining,
    /// Background work has ended and the transport is closed.
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Running => write!(f, "RUNNING"),
            AgentState::Draining => write!(f, "DRAINING"),
            AgentState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A named participant that can invoke operations on its peers.
#[async_trait]
pub trait RpcAgent: Send + Sync {
    /// This agent's worker name.
    fn name(&self) -> &str;

    fn state(&self) -> AgentState;

    /// Names of every group member, ordered by rank.
    fn worker_names(&self) -> Vec<String>;

    /// Send `operation` to `destination` and return immediately.
    ///
    /// Fails synchronously with [`RpcError::UnknownDestination`] for a name
    /// outside the group and with [`RpcError::ShuttingDown`] once `join()`
    /// has started; in both cases no request is sent.
    ///
    /// [`RpcError::UnknownDestination`]: crate::RpcError::UnknownDestination
    /// [`RpcError::ShuttingDown`]: crate::RpcError::ShuttingDown
    fn invoke_async(
        &self,
        destination: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<FutureMessage>;

    /// `invoke_async` followed by `wait`.
    async fn invoke_sync(
        &self,
        destination: &str,
        operation: &str,
        payload: Bytes,
    ) -> Result<Message> {
        self.invoke_async(destination, operation, payload)?
            .wait()
            .await
    }

    /// Collective barrier. Returns once every agent in the group has called
    /// `sync()` and every RPC issued before it, by any agent, has resolved.
    /// Concurrent calls on one agent take their turn, one barrier round each.
    async fn sync(&self) -> Result<()>;

    /// Graceful shutdown: refuse new RPCs, let in-flight ones finish, tell
    /// peers, and stop background work. Every call, including ones made
    /// after an earlier caller gave up waiting, returns once the agent has
    /// stopped.
    async fn join(&self) -> Result<()>;
}
