//! In-process process group.
//!
//! All ranks share one address space and talk over unbounded channels. Used
//! for tests and for running several agents inside one program.

use super::barrier::BarrierBoard;
use super::{flag_raised, GroupEvent, ProcessGroup};
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

struct Shared {
    inboxes: Vec<mpsc::UnboundedSender<GroupEvent>>,
    /// Barrier board per rank, indexed like `inboxes`.
    boards: Vec<BarrierBoard>,
    lost: Mutex<HashSet<usize>>,
}

impl Shared {
    fn is_lost(&self, rank: usize) -> bool {
        self.lost
            .lock()
            .map(|lost| lost.contains(&rank))
            .unwrap_or(true)
    }
}

/// One member of an in-memory process group.
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    next_epoch: AtomicU64,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.shared.inboxes.len())
            .finish()
    }
}

impl LocalProcessGroup {
    /// Create all `size` members of a new group, indexed by rank.
    pub fn create(size: usize) -> Vec<LocalProcessGroup> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();

        let shared = Arc::new(Shared {
            inboxes: senders,
            boards: (0..size).map(|_| BarrierBoard::default()).collect(),
            lost: Mutex::new(HashSet::new()),
        });

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalProcessGroup {
                rank,
                shared: shared.clone(),
                inbox: tokio::sync::Mutex::new(inbox),
                next_epoch: AtomicU64::new(0),
                closed: watch::channel(false).0,
            })
            .collect()
    }

    /// Simulate the loss of this rank: every other member observes
    /// [`GroupEvent::PeerLost`], sends to this rank fail, barriers on other
    /// ranks fail instead of waiting for it, and this member stops receiving.
    pub fn abort(&self) {
        let newly_lost = match self.shared.lost.lock() {
            Ok(mut lost) => lost.insert(self.rank),
            Err(_) => false,
        };
        if newly_lost {
            warn!("Local group rank {} aborted", self.rank);
            for (rank, inbox) in self.shared.inboxes.iter().enumerate() {
                if rank != self.rank {
                    self.shared.boards[rank].peer_lost(self.rank);
                    let _ = inbox.send(GroupEvent::PeerLost {
                        rank: self.rank,
                        reason: "rank aborted".to_string(),
                    });
                }
            }
        }
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    async fn send(&self, dst: usize, data: Bytes) -> Result<()> {
        let inbox = self.shared.inboxes.get(dst).ok_or_else(|| RpcError::Transport {
            message: format!("rank {} is outside the group of {}", dst, self.size()),
        })?;
        if *self.closed.borrow() {
            return Err(RpcError::Transport {
                message: format!("rank {} has closed its group handle", self.rank),
            });
        }
        if self.shared.is_lost(dst) {
            return Err(RpcError::Transport {
                message: format!("rank {} is unreachable", dst),
            });
        }
        inbox
            .send(GroupEvent::Frame {
                src: self.rank,
                data,
            })
            .map_err(|_| RpcError::Transport {
                message: format!("rank {} has gone away", dst),
            })
    }

    async fn recv_any(&self) -> Option<GroupEvent> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            event = inbox.recv() => event,
            _ = flag_raised(closed) => None,
        }
    }

    async fn barrier(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(RpcError::Transport {
                message: format!("rank {} has closed its group handle", self.rank),
            });
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        for (rank, board) in self.shared.boards.iter().enumerate() {
            if rank != self.rank {
                board.arrive(epoch);
            }
        }
        self.shared.boards[self.rank]
            .wait(epoch, self.size() - 1)
            .await
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing local group rank {}", self.rank);
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_and_recv_any() {
        let group = LocalProcessGroup::create(3);
        group[0].send(2, Bytes::from_static(b"a")).await.unwrap();
        group[1].send(2, Bytes::from_static(b"b")).await.unwrap();

        let first = group[2].recv_any().await.unwrap();
        let second = group[2].recv_any().await.unwrap();
        assert_eq!(
            first,
            GroupEvent::Frame {
                src: 0,
                data: Bytes::from_static(b"a")
            }
        );
        assert_eq!(
            second,
            GroupEvent::Frame {
                src: 1,
                data: Bytes::from_static(b"b")
            }
        );
    }

    #[tokio::test]
    async fn test_send_to_self_loops_back() {
        let group = LocalProcessGroup::create(1);
        group[0].send(0, Bytes::from_static(b"me")).await.unwrap();
        assert!(matches!(
            group[0].recv_any().await,
            Some(GroupEvent::Frame { src: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_send_out_of_range_fails() {
        let group = LocalProcessGroup::create(2);
        assert!(group[0].send(5, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_notifies_peers_and_blocks_sends() {
        let group = LocalProcessGroup::create(2);
        group[1].abort();

        assert_eq!(
            group[0].recv_any().await,
            Some(GroupEvent::PeerLost {
                rank: 1,
                reason: "rank aborted".to_string()
            })
        );
        assert!(group[0].send(1, Bytes::new()).await.is_err());
        assert!(group[1].recv_any().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let group = Arc::new(LocalProcessGroup::create(1).remove(0));
        let receiver = group.clone();
        let pending = tokio::spawn(async move { receiver.recv_any().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        group.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_barrier_releases_all_ranks() {
        let group: Vec<Arc<LocalProcessGroup>> =
            LocalProcessGroup::create(3).into_iter().map(Arc::new).collect();

        let early: Vec<_> = group[..2]
            .iter()
            .cloned()
            .map(|member| tokio::spawn(async move { member.barrier().await }))
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(early.iter().all(|handle| !handle.is_finished()));

        group[2].barrier().await.unwrap();
        for handle in early {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_barriers_on_one_rank_wait_for_the_other() {
        let group: Vec<Arc<LocalProcessGroup>> =
            LocalProcessGroup::create(2).into_iter().map(Arc::new).collect();

        let overlapping: Vec<_> = (0..2)
            .map(|_| {
                let member = group[0].clone();
                tokio::spawn(async move { member.barrier().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(overlapping.iter().all(|handle| !handle.is_finished()));

        group[1].barrier().await.unwrap();
        group[1].barrier().await.unwrap();
        for handle in overlapping {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_abort_fails_pending_and_later_barriers() {
        let group: Vec<Arc<LocalProcessGroup>> =
            LocalProcessGroup::create(3).into_iter().map(Arc::new).collect();

        let member = group[0].clone();
        let pending = tokio::spawn(async move { member.barrier().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        group[2].abort();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RpcError::Transport { .. })));
        assert!(group[1].barrier().await.is_err());
        assert!(group[2].barrier().await.is_err());
    }
}
