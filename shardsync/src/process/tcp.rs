use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::types::Rank;

use super::ProcessGroup;

/// Process rank every other process connects to.
const HUB: Rank = 0;

/// Upper bound on a single frame. Checkpoint items above 4 GiB must be split
/// by the caller.
const MAX_FRAME_BYTES: u64 = 1 << 32;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A [`ProcessGroup`] over TCP in a star topology around process rank 0.
///
/// Rank 0 holds one connection per peer and relays broadcasts from non-zero
/// roots; every other rank holds a single connection to rank 0. Frames are
/// `[len: u64 LE][payload]`. Operations block the caller on an owned tokio
/// runtime.
pub struct TcpProcessGroup {
    rank: Rank,
    world: usize,
    /// Indexed by peer rank. Rank 0 has every slot but its own; others only slot 0.
    links: Vec<Option<Mutex<TcpStream>>>,
    id: String,
    rt: tokio::runtime::Runtime,
}

impl TcpProcessGroup {
    /// Join a group of `world` processes as `rank`. Rank 0 listens on `addr`;
    /// every other rank connects to it, retrying until `config.connect_timeout`.
    pub fn connect(rank: Rank, world: usize, addr: SocketAddr, config: &SyncConfig) -> Result<Self> {
        check_layout(rank, world)?;
        let rt = build_runtime()?;
        if world == 1 {
            return Ok(Self::new(rank, world, vec![None], rt));
        }
        if rank == HUB {
            let listener = rt.block_on(TcpListener::bind(addr))?;
            let links = rt.block_on(accept_peers(listener, world, config.connect_timeout))?;
            Ok(Self::new(rank, world, links, rt))
        } else {
            let stream = rt.block_on(connect_to_hub(addr, rank, world, config.connect_timeout))?;
            let mut links: Vec<Option<Mutex<TcpStream>>> = (0..world).map(|_| None).collect();
            links[HUB] = Some(Mutex::new(stream));
            Ok(Self::new(rank, world, links, rt))
        }
    }

    /// Form a `world`-process group over loopback inside this process.
    ///
    /// A convenience for tests and single-host runs; element `i` of the result
    /// is rank `i`.
    pub fn bootstrap_local(world: usize) -> Result<Vec<Self>> {
        check_layout(0, world)?;
        let config = SyncConfig::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        // Peers connect first; the listener backlog holds them until rank 0 accepts.
        let mut peers = Vec::with_capacity(world.saturating_sub(1));
        for rank in 1..world {
            peers.push(Self::connect(rank, world, addr, &config)?);
        }

        let rt = build_runtime()?;
        let links = if world == 1 {
            vec![None]
        } else {
            listener.set_nonblocking(true)?;
            let listener = {
                let _guard = rt.enter();
                TcpListener::from_std(listener)?
            };
            rt.block_on(accept_peers(listener, world, config.connect_timeout))?
        };

        let mut groups = Vec::with_capacity(world);
        groups.push(Self::new(HUB, world, links, rt));
        groups.extend(peers);
        Ok(groups)
    }

    fn new(
        rank: Rank,
        world: usize,
        links: Vec<Option<Mutex<TcpStream>>>,
        rt: tokio::runtime::Runtime,
    ) -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let id = format!("{host}:{} rank {rank}/{world}", std::process::id());
        tracing::debug!(rank, world, "tcp process group ready");
        Self {
            rank,
            world,
            links,
            id,
            rt,
        }
    }

    fn link(&self, peer: Rank) -> Result<&Mutex<TcpStream>> {
        self.links
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| SyncError::messaging(format!("rank {} has no link to rank {peer}", self.rank)))
    }

    async fn send_to(&self, peer: Rank, data: &[u8]) -> Result<()> {
        let mut stream = self.link(peer)?.lock().await;
        write_frame(&mut stream, data)
            .await
            .map_err(|e| SyncError::messaging_with_source(format!("send to rank {peer}"), e))
    }

    async fn recv_from(&self, peer: Rank) -> Result<Vec<u8>> {
        let mut stream = self.link(peer)?.lock().await;
        read_frame(&mut stream)
            .await
            .map_err(|e| SyncError::messaging_with_source(format!("recv from rank {peer}"), e))
    }

    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.world {
            return Err(SyncError::ProcessLayout {
                reason: format!("broadcast root {root} out of range for {} processes", self.world),
            });
        }
        Ok(())
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_processes(&self) -> usize {
        self.world
    }

    fn barrier(&self) -> Result<()> {
        if self.world == 1 {
            return Ok(());
        }
        self.rt.block_on(async {
            if self.rank == HUB {
                try_join_all((1..self.world).map(|r| self.recv_from(r))).await?;
                try_join_all((1..self.world).map(|r| self.send_to(r, &[]))).await?;
            } else {
                self.send_to(HUB, &[]).await?;
                self.recv_from(HUB).await?;
            }
            Ok(())
        })
    }

    fn broadcast_bytes(&self, data: &mut Vec<u8>, root: Rank) -> Result<()> {
        self.check_root(root)?;
        if self.world == 1 {
            return Ok(());
        }
        self.rt.block_on(async {
            if self.rank == HUB {
                if root != HUB {
                    *data = self.recv_from(root).await?;
                }
                let payload = &data[..];
                let targets = (1..self.world).filter(|&r| r != root);
                try_join_all(targets.map(|r| self.send_to(r, payload))).await?;
            } else if self.rank == root {
                self.send_to(HUB, data).await?;
            } else {
                *data = self.recv_from(HUB).await?;
            }
            Ok(())
        })
    }

    fn id_string(&self) -> String {
        self.id.clone()
    }
}

fn check_layout(rank: Rank, world: usize) -> Result<()> {
    if world == 0 || rank >= world {
        return Err(SyncError::ProcessLayout {
            reason: format!("process rank {rank} out of range for {world} processes"),
        });
    }
    Ok(())
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SyncError::messaging_with_source("tokio runtime", e))
}

/// Accept one connection per non-zero rank and slot each by its handshake.
async fn accept_peers(
    listener: TcpListener,
    world: usize,
    timeout: Duration,
) -> Result<Vec<Option<Mutex<TcpStream>>>> {
    let mut links: Vec<Option<Mutex<TcpStream>>> = (0..world).map(|_| None).collect();
    let accept_all = async {
        for _ in 1..world {
            let (mut stream, from) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let peer = stream.read_u64_le().await? as usize;
            let peer_world = stream.read_u64_le().await? as usize;
            if peer_world != world || peer == HUB || peer >= world {
                return Err(SyncError::ProcessLayout {
                    reason: format!(
                        "peer at {from} announced rank {peer} of {peer_world}, expected a rank in 1..{world}"
                    ),
                });
            }
            if links[peer].is_some() {
                return Err(SyncError::ProcessLayout {
                    reason: format!("rank {peer} connected twice"),
                });
            }
            tracing::trace!(peer, %from, "accepted peer");
            links[peer] = Some(Mutex::new(stream));
        }
        Ok::<(), SyncError>(())
    };
    tokio::time::timeout(timeout, accept_all)
        .await
        .map_err(|_| SyncError::messaging(format!("timed out waiting for {} peers", world - 1)))??;
    Ok(links)
}

async fn connect_to_hub(
    addr: SocketAddr,
    rank: Rank,
    world: usize,
    timeout: Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(s) => break s,
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(rank, %addr, "connect failed, retrying: {e}");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(SyncError::messaging_with_source(
                    format!("rank {rank} could not reach rank 0 at {addr}"),
                    e,
                ));
            }
        }
    };
    stream.set_nodelay(true)?;
    stream.write_u64_le(rank as u64).await?;
    stream.write_u64_le(world as u64).await?;
    stream.flush().await?;
    Ok(stream)
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_u64_le(data.len() as u64).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u64_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    // grow with the data actually received rather than trusting the prefix
    let mut buf = Vec::new();
    (&mut *stream).take(len).read_to_end(&mut buf).await?;
    if buf.len() as u64 != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame truncated at {} of {len} bytes", buf.len()),
        ));
    }
    Ok(buf)
}
