//! Epoch-numbered barrier bookkeeping shared by the transports.
//!
//! Each member owns one board. Entering barrier `n` posts an arrival for
//! epoch `n` on every other member's board, then waits until its own board
//! has seen `size - 1` arrivals for that epoch. Epochs are numbered per
//! member, so two overlapping barriers on one rank count as two epochs and
//! never stand in for another rank.

use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
pub(crate) struct BarrierBoard {
    arrivals: Mutex<BoardState>,
    changed: Notify,
}

#[derive(Default)]
struct BoardState {
    counts: HashMap<u64, usize>,
    lost_peer: Option<usize>,
}

impl BarrierBoard {
    pub(crate) fn arrive(&self, epoch: u64) {
        if let Ok(mut state) = self.arrivals.lock() {
            *state.counts.entry(epoch).or_insert(0) += 1;
        }
        self.changed.notify_waiters();
    }

    /// Fail every current and later wait that is still short of arrivals.
    pub(crate) fn peer_lost(&self, rank: usize) {
        if let Ok(mut state) = self.arrivals.lock() {
            state.lost_peer.get_or_insert(rank);
        }
        self.changed.notify_waiters();
    }

    pub(crate) async fn wait(&self, epoch: u64, expected: usize) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.arrivals.lock().map_err(|_| RpcError::Transport {
                    message: "barrier state poisoned".to_string(),
                })?;
                if state.counts.get(&epoch).copied().unwrap_or(0) >= expected {
                    state.counts.remove(&epoch);
                    return Ok(());
                }
                if let Some(rank) = state.lost_peer {
                    return Err(RpcError::Transport {
                        message: format!("rank {} was lost before the barrier completed", rank),
                    });
                }
            }
            notified.await;
        }
    }
}
