//! TCP process group: one rank per process, full mesh.
//!
//! Every rank listens on its own address and opens one outbound connection to
//! every other rank. Outbound connections carry this rank's frames; inbound
//! connections are only read from. The first frame on every connection is a
//! `HELLO` naming the connecting rank.
//!
//! # Thread Safety
//!
//! Each outbound stream sits behind its own tokio `Mutex`, so concurrent
//! senders to different ranks do not contend. Inbound connections are drained
//! by one reader task each into a shared event queue.

use super::barrier::BarrierBoard;
use super::frame::{read_frame, write_frame, GroupFrame};
use super::{flag_raised, GroupEvent, ProcessGroup};
use crate::config::GroupConfig;
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A bound but not yet connected TCP group member.
///
/// Binding first lets callers use port 0 and learn the real address before
/// distributing the address list.
pub struct TcpGroupListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpGroupListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Join the group as `rank`. `addrs[r]` is the listening address of rank
    /// `r`; `addrs[rank]` must be this listener's address.
    ///
    /// Returns once outbound connections to every other rank are established.
    pub async fn connect(self, rank: usize, addrs: &[SocketAddr]) -> Result<TcpProcessGroup> {
        let size = addrs.len();
        if rank >= size {
            return Err(RpcError::invalid_config(format!(
                "rank {} is outside a group of {}",
                rank, size
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let board = Arc::new(BarrierBoard::default());

        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            rank,
            size,
            events_tx.clone(),
            board.clone(),
            closed_rx,
        ));

        let connects = addrs
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != rank)
            .map(|(peer, addr)| async move {
                let stream = connect_with_retry(*addr).await?;
                Ok::<_, RpcError>((peer, stream))
            });
        // On an early return `closed_tx` drops, which stops the accept loop.
        let streams = futures::future::try_join_all(connects).await?;

        let mut writers: Vec<Option<tokio::sync::Mutex<TcpStream>>> =
            (0..size).map(|_| None).collect();
        for (peer, mut stream) in streams {
            let hello = GroupFrame::Hello { rank: rank as u32 }.to_bytes();
            write_frame(&mut stream, &hello).await?;
            writers[peer] = Some(tokio::sync::Mutex::new(stream));
        }

        info!("TCP group rank {} connected to {} peers", rank, size - 1);

        Ok(TcpProcessGroup {
            rank,
            size,
            writers,
            events_tx,
            events: tokio::sync::Mutex::new(events_rx),
            board,
            next_epoch: AtomicU64::new(0),
            closed: closed_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

/// One member of a TCP process group.
pub struct TcpProcessGroup {
    rank: usize,
    size: usize,
    /// Outbound stream per rank; `None` at this rank's own index.
    writers: Vec<Option<tokio::sync::Mutex<TcpStream>>>,
    events_tx: mpsc::UnboundedSender<GroupEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    board: Arc<BarrierBoard>,
    next_epoch: AtomicU64,
    closed: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpProcessGroup {
    /// Bind the listening socket for one member.
    pub async fn bind(addr: SocketAddr) -> Result<TcpGroupListener> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        debug!("TCP group listener bound on {}", addr);
        Ok(TcpGroupListener { listener, addr })
    }

    fn writer(&self, dst: usize) -> Result<&tokio::sync::Mutex<TcpStream>> {
        self.writers
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or_else(|| RpcError::Transport {
                message: format!("no connection to rank {}", dst),
            })
    }

    async fn write_to(&self, dst: usize, frame: &GroupFrame) -> Result<()> {
        let mut stream = self.writer(dst)?.lock().await;
        write_frame(&mut *stream, &frame.to_bytes())
            .await
            .map_err(|e| RpcError::Transport {
                message: format!("send to rank {} failed: {}", dst, e),
            })
    }
}

impl Drop for TcpProcessGroup {
    fn drop(&mut self) {
        // The accept loop aborts its readers once it sees the flag.
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&self, dst: usize, data: Bytes) -> Result<()> {
        if *self.closed.borrow() {
            return Err(RpcError::Transport {
                message: "group is closed".to_string(),
            });
        }
        if dst == self.rank {
            return self
                .events_tx
                .send(GroupEvent::Frame {
                    src: self.rank,
                    data,
                })
                .map_err(|_| RpcError::Transport {
                    message: "local event queue is closed".to_string(),
                });
        }
        self.write_to(dst, &GroupFrame::Data(data)).await
    }

    async fn recv_any(&self) -> Option<GroupEvent> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut events = self.events.lock().await;
        tokio::select! {
            event = events.recv() => event,
            _ = flag_raised(closed) => None,
        }
    }

    async fn barrier(&self) -> Result<()> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        for peer in (0..self.size).filter(|peer| *peer != self.rank) {
            self.write_to(peer, &GroupFrame::Barrier { epoch }).await?;
        }
        self.board.wait(epoch, self.size - 1).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        for writer in self.writers.iter().flatten() {
            let mut stream = writer.lock().await;
            if let Err(e) = stream.shutdown().await {
                debug!("TCP group shutdown of outbound stream failed: {}", e);
            }
        }
        let accept_task = self
            .accept_task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(handle) = accept_task {
            if let Err(e) = handle.await {
                warn!("TCP group accept loop ended abnormally: {}", e);
            }
        }
        info!("TCP group rank {} closed", self.rank);
        Ok(())
    }
}

async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let attempt = async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(e) => {
                    debug!("TCP group connect to {} failed, retrying: {}", addr, e);
                    tokio::time::sleep(GroupConfig::CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
    };
    let stream = tokio::time::timeout(GroupConfig::CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| RpcError::Transport {
            message: format!(
                "could not reach group member at {} within {:?}",
                addr,
                GroupConfig::CONNECT_TIMEOUT
            ),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn accept_loop(
    listener: TcpListener,
    rank: usize,
    size: usize,
    events: mpsc::UnboundedSender<GroupEvent>,
    board: Arc<BarrierBoard>,
    closed: watch::Receiver<bool>,
) {
    let mut readers = Vec::new();
    loop {
        tokio::select! {
            _ = flag_raised(closed.clone()) => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("TCP group rank {} accepted connection from {}", rank, peer_addr);
                        readers.push(tokio::spawn(read_peer(
                            stream,
                            size,
                            events.clone(),
                            board.clone(),
                            closed.clone(),
                        )));
                    }
                    Err(e) => {
                        error!("TCP group accept error: {}", e);
                    }
                }
            }
        }
    }
    for reader in readers {
        reader.abort();
    }
}

async fn read_peer(
    mut stream: TcpStream,
    size: usize,
    events: mpsc::UnboundedSender<GroupEvent>,
    board: Arc<BarrierBoard>,
    closed: watch::Receiver<bool>,
) {
    let src = match read_frame(&mut stream).await {
        Ok(Some(raw)) => match GroupFrame::parse(raw) {
            Ok(GroupFrame::Hello { rank }) if (rank as usize) < size => rank as usize,
            other => {
                warn!("TCP group connection did not open with a valid HELLO: {:?}", other);
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!("TCP group handshake failed: {}", e);
            return;
        }
    };

    let reason = loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(raw)) => GroupFrame::parse(raw),
            Ok(None) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        };
        match frame {
            Ok(GroupFrame::Data(data)) => {
                if events.send(GroupEvent::Frame { src, data }).is_err() {
                    return;
                }
            }
            Ok(GroupFrame::Barrier { epoch }) => board.arrive(epoch),
            Ok(GroupFrame::Hello { .. }) => {
                warn!("TCP group rank {} sent a second HELLO; ignoring", src);
            }
            Err(e) => break e.to_string(),
        }
    };

    if *closed.borrow() {
        return;
    }
    debug!("TCP group lost rank {}: {}", src, reason);
    board.peer_lost(src);
    let _ = events.send(GroupEvent::PeerLost { rank: src, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn mesh(size: usize) -> Vec<TcpProcessGroup> {
        let mut listeners = Vec::new();
        for _ in 0..size {
            listeners.push(
                TcpProcessGroup::bind("127.0.0.1:0".parse().unwrap())
                    .await
                    .unwrap(),
            );
        }
        let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr()).collect();
        let joins = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let addrs = addrs.clone();
                tokio::spawn(async move { listener.connect(rank, &addrs).await })
            })
            .collect::<Vec<_>>();

        let mut members = Vec::new();
        for join in joins {
            members.push(join.await.unwrap().unwrap());
        }
        members
    }

    #[tokio::test]
    async fn test_tcp_group_send_recv() {
        let group = mesh(2).await;

        group[0].send(1, Bytes::from_static(b"ping")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), group[1].recv_any())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(GroupEvent::Frame {
                src: 0,
                data: Bytes::from_static(b"ping")
            })
        );
    }

    #[tokio::test]
    async fn test_tcp_group_self_send() {
        let group = mesh(2).await;
        group[1].send(1, Bytes::from_static(b"me")).await.unwrap();
        assert!(matches!(
            group[1].recv_any().await,
            Some(GroupEvent::Frame { src: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_group_preserves_order_per_pair() {
        let group = mesh(2).await;
        for i in 0..20u8 {
            group[0].send(1, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..20u8 {
            match group[1].recv_any().await {
                Some(GroupEvent::Frame { src: 0, data }) => assert_eq!(data.as_ref(), &[i]),
                other => panic!("Expected frame {}, got: {:?}", i, other),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_tcp_group_barrier() {
        let group: Vec<Arc<TcpProcessGroup>> = mesh(3).await.into_iter().map(Arc::new).collect();

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

    #[tokio::test]
    async fn test_tcp_group_reports_lost_peer() {
        let mut group = mesh(2).await;
        let dropped = group.pop().unwrap();
        drop(dropped);

        let event = tokio::time::timeout(Duration::from_secs(5), group[0].recv_any())
            .await
            .unwrap();
        assert!(matches!(event, Some(GroupEvent::PeerLost { rank: 1, .. })));
    }

    #[tokio::test]
    async fn test_tcp_group_close_ends_recv() {
        let group = mesh(2).await;
        group[0].close().await.unwrap();
        assert!(group[0].recv_any().await.is_none());
        assert!(group[0].send(1, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_rank_out_of_range() {
        let listener = TcpProcessGroup::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addrs = vec![listener.local_addr()];
        assert!(listener.connect(1, &addrs).await.is_err());
    }
}
