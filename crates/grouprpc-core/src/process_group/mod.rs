//! Collective transports that agents run on.
//!
//! A process group is a fixed membership of `size` ranks that can send a
//! frame to any rank, receive frames from any rank, and meet at a barrier.
//!
//! - **Local**: every rank lives in this process ([`LocalProcessGroup`]).
//! - **TCP**: one rank per process, full mesh of TCP connections
//!   ([`TcpProcessGroup`]).

mod barrier;
pub mod frame;
pub mod local;
pub mod tcp;

pub use local::LocalProcessGroup;
pub use tcp::{TcpGroupListener, TcpProcessGroup};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

/// Something that arrived from the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// An opaque frame sent by rank `src`.
    Frame { src: usize, data: Bytes },
    /// Rank `rank` became unreachable. No further frames arrive from it.
    PeerLost { rank: usize, reason: String },
}

/// Point-to-point plus collective communication between a fixed set of ranks.
///
/// Frames between one pair of ranks are delivered in send order.
#[async_trait]
pub trait ProcessGroup: Send + Sync + 'static {
    /// This member's rank, in `0..size()`.
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send `data` to rank `dst`. Sending to the own rank loops back.
    async fn send(&self, dst: usize, data: Bytes) -> Result<()>;

    /// Wait for the next event from any rank. Returns `None` once the group
    /// has been closed.
    ///
    /// Must be cancel-safe: dropping the returned future before completion
    /// must not lose an event.
    async fn recv_any(&self) -> Option<GroupEvent>;

    /// Block until every rank has entered the barrier.
    async fn barrier(&self) -> Result<()>;

    /// Release transport resources. Pending and later `recv_any` calls
    /// return `None`.
    async fn close(&self) -> Result<()>;
}

/// Resolve once `flag` reads `true` or its sender is gone.
pub(crate) async fn flag_raised(mut flag: watch::Receiver<bool>) {
    while !*flag.borrow_and_update() {
        if flag.changed().await.is_err() {
            return;
        }
    }
}
