//! Star-topology TCP transport
//!
//! Root listens, every other rank connects and introduces itself with a
//! fixed magic followed by its rank. Messages are length-prefixed frames
//! (u64 little-endian length, then payload).

use super::{check_root, Communicator, ROOT};
use crate::error::{CommError, CommResult};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 8] = b"TRAJPAR1";

/// Pause between connection attempts to root
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Refuse frames larger than this
const MAX_FRAME: u64 = 1 << 34;

/// Up-front allocation for an incoming frame; the rest grows as bytes arrive
const FRAME_CHUNK: u64 = 1 << 20;

enum Role {
    /// Streams indexed by rank - 1
    Root(Vec<TcpStream>),
    Member(TcpStream),
}

/// One rank of a TCP star
pub struct TcpCommunicator {
    rank: usize,
    size: usize,
    role: Role,
}

impl TcpCommunicator {
    /// Bind root on `addr` (root) or connect to it (other ranks)
    pub fn establish(rank: usize, size: usize, addr: &str, window: Duration) -> CommResult<Self> {
        if rank == ROOT {
            let listener = TcpListener::bind(addr).map_err(|e| CommError::Rendezvous {
                rank,
                addr: addr.to_string(),
                reason: format!("bind failed: {e}"),
            })?;
            Self::accept(listener, size)
        } else {
            Self::connect(rank, size, addr, window)
        }
    }

    /// Accept `size - 1` ranks on an already bound listener
    pub fn accept(listener: TcpListener, size: usize) -> CommResult<Self> {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(addr = %addr, peers = size.saturating_sub(1), "Waiting for ranks");

        let mut slots: Vec<Option<TcpStream>> = (1..size).map(|_| None).collect();
        let mut joined = 0;
        while joined + 1 < size {
            let (mut stream, peer) = listener.accept().map_err(|e| CommError::Rendezvous {
                rank: ROOT,
                addr: addr.clone(),
                reason: format!("accept failed: {e}"),
            })?;
            let rank = read_hello(&mut stream)?;
            if rank == ROOT || rank >= size {
                return Err(CommError::Protocol(format!(
                    "{peer} claims rank {rank} in a group of {size}"
                )));
            }
            let slot = &mut slots[rank - 1];
            if slot.is_some() {
                return Err(CommError::Protocol(format!("rank {rank} connected twice")));
            }
            let _ = stream.set_nodelay(true);
            debug!(rank, peer = %peer, "Rank joined");
            *slot = Some(stream);
            joined += 1;
        }

        let peers = slots.into_iter().flatten().collect();
        Ok(Self {
            rank: ROOT,
            size,
            role: Role::Root(peers),
        })
    }

    /// Connect to root, retrying until `window` elapses
    pub fn connect(rank: usize, size: usize, addr: &str, window: Duration) -> CommResult<Self> {
        let deadline = Instant::now() + window;
        let mut stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(rank, error = %e, "Root not reachable yet");
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => {
                    warn!(rank, addr, "Giving up on root");
                    return Err(CommError::Rendezvous {
                        rank,
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };
        let _ = stream.set_nodelay(true);

        let mut hello = Vec::with_capacity(16);
        hello.extend_from_slice(MAGIC);
        hello.extend_from_slice(&(rank as u64).to_le_bytes());
        stream.write_all(&hello).map_err(|e| peer_lost(ROOT, e))?;

        Ok(Self {
            rank,
            size,
            role: Role::Member(stream),
        })
    }
}

fn read_hello(stream: &mut impl Read) -> CommResult<usize> {
    let mut buf = [0u8; 16];
    stream
        .read_exact(&mut buf)
        .map_err(|e| CommError::Protocol(format!("incomplete handshake: {e}")))?;
    if &buf[..8] != MAGIC {
        return Err(CommError::Protocol("bad handshake magic".into()));
    }
    let mut rank = [0u8; 8];
    rank.copy_from_slice(&buf[8..]);
    Ok(u64::from_le_bytes(rank) as usize)
}

fn peer_lost(peer: usize, err: io::Error) -> CommError {
    CommError::PeerLost {
        peer,
        reason: err.to_string(),
    }
}

/// Write one length-prefixed frame
pub(crate) fn write_frame(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    w.write_all(&(data.len() as u64).to_le_bytes())?;
    w.write_all(data)?;
    w.flush()
}

/// Read one length-prefixed frame
pub(crate) fn read_frame(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 8];
    r.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut data = Vec::with_capacity(len.min(FRAME_CHUNK) as usize);
    r.by_ref().take(len).read_to_end(&mut data)?;
    if data.len() as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated at {} of {len} bytes", data.len()),
        ));
    }
    Ok(data)
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast_bytes(&mut self, root: usize, data: Option<Vec<u8>>) -> CommResult<Vec<u8>> {
        check_root(root)?;
        match &mut self.role {
            Role::Root(peers) => {
                let data = data.ok_or_else(|| CommError::Protocol("root broadcast without data".into()))?;
                for (i, stream) in peers.iter_mut().enumerate() {
                    write_frame(stream, &data).map_err(|e| peer_lost(i + 1, e))?;
                }
                Ok(data)
            }
            Role::Member(stream) => read_frame(stream).map_err(|e| peer_lost(ROOT, e)),
        }
    }

    fn gather_bytes(&mut self, root: usize, data: Vec<u8>) -> CommResult<Option<Vec<Vec<u8>>>> {
        check_root(root)?;
        match &mut self.role {
            Role::Root(peers) => {
                let mut parts = Vec::with_capacity(self.size);
                parts.push(data);
                for (i, stream) in peers.iter_mut().enumerate() {
                    parts.push(read_frame(stream).map_err(|e| peer_lost(i + 1, e))?);
                }
                Ok(Some(parts))
            }
            Role::Member(stream) => {
                write_frame(stream, &data).map_err(|e| peer_lost(ROOT, e))?;
                Ok(None)
            }
        }
    }
}
