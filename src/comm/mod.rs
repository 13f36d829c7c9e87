//! Distributed coordination
//!
//! Ranks form a star rooted at rank 0. The only collectives are a broadcast
//! from root and a gather to root, which is all the engine needs: root
//! resolves run metadata once and broadcasts it, every rank fills its own
//! result buffers, and root gathers them in rank order.
//!
//! ```text
//!            rank 0 (root)
//!           /     |      \
//!      rank 1  rank 2 .. rank N-1
//! ```
//!
//! Two transports implement [`Communicator`]:
//! - [`TcpCommunicator`] for ranks started by an external launcher
//! - [`LocalGroup`] for in-process ranks over channels

mod local;
mod tcp;

pub use local::{LocalCommunicator, LocalGroup};
pub use tcp::TcpCommunicator;

use crate::error::{CommError, CommResult, ConfigError, TrajparError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Rank that roots every collective
pub const ROOT: usize = 0;

/// Variables set by common launchers for the rank of the current process
pub const RANK_VARS: &[&str] = &[
    "PMI_RANK",
    "OMPI_COMM_WORLD_RANK",
    "OMPI_MCA_ns_nds_vpid",
    "PMI_ID",
    "SLURM_PROCID",
    "LAMRANK",
    "MPI_RANKID",
    "MP_CHILD",
    "MP_RANK",
    "MPIRUN_RANK",
];

/// Variables set by common launchers for the number of processes
pub const SIZE_VARS: &[&str] = &[
    "PMI_SIZE",
    "OMPI_COMM_WORLD_SIZE",
    "SLURM_NTASKS",
    "MP_PROCS",
    "MPIRUN_NPROCS",
];

pub const ADDR_VAR: &str = "TRAJPAR_MASTER_ADDR";
pub const PORT_VAR: &str = "TRAJPAR_MASTER_PORT";
pub const DEFAULT_ADDR: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 29500;

/// How long non-root ranks keep retrying to reach root
pub const CONNECT_WINDOW: Duration = Duration::from_secs(60);

/// Point-to-root transport
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Send `data` from `root` to every rank
    ///
    /// Root passes `Some`, the others `None`; every rank gets root's bytes.
    fn broadcast_bytes(&mut self, root: usize, data: Option<Vec<u8>>) -> CommResult<Vec<u8>>;

    /// Collect one contribution per rank on `root`, in rank order
    fn gather_bytes(&mut self, root: usize, data: Vec<u8>) -> CommResult<Option<Vec<Vec<u8>>>>;
}

pub(crate) fn check_root(root: usize) -> CommResult<()> {
    if root == ROOT {
        Ok(())
    } else {
        Err(CommError::UnsupportedRoot(root))
    }
}

/// Distributed launch parameters read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub rank: usize,
    pub size: usize,
    pub addr: String,
    pub port: u16,
}

impl LaunchEnv {
    /// Detect a distributed launch from the process environment
    ///
    /// Returns `None` when no rank variable is set.
    pub fn detect() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Detect a launch from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some((rank_var, rank)) = RANK_VARS
            .iter()
            .find_map(|&var| lookup(var).map(|v| (var, v)))
        else {
            return Ok(None);
        };
        let rank: usize = rank.trim().parse().map_err(|_| {
            ConfigError::IncompleteLaunch(format!("{rank_var}='{rank}' is not a rank"))
        })?;

        let (size_var, size) = SIZE_VARS
            .iter()
            .find_map(|&var| lookup(var).map(|v| (var, v)))
            .ok_or_else(|| {
                ConfigError::IncompleteLaunch(format!(
                    "{rank_var} is set but none of {} is",
                    SIZE_VARS.join(", ")
                ))
            })?;
        let size: usize = size.trim().parse().map_err(|_| {
            ConfigError::IncompleteLaunch(format!("{size_var}='{size}' is not a group size"))
        })?;
        if size == 0 || rank >= size {
            return Err(ConfigError::IncompleteLaunch(format!(
                "rank {rank} is outside a group of {size}"
            )));
        }

        let addr = lookup(ADDR_VAR).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let port = match lookup(PORT_VAR) {
            Some(p) => p.trim().parse().map_err(|_| {
                ConfigError::IncompleteLaunch(format!("{PORT_VAR}='{p}' is not a port"))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Some(Self {
            rank,
            size,
            addr,
            port,
        }))
    }

    /// `host:port` of the root rank
    pub fn root_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Join the group over TCP
    pub fn connect(&self) -> CommResult<TcpCommunicator> {
        info!(rank = self.rank, size = self.size, root = %self.root_addr(), "Joining distributed group");
        TcpCommunicator::establish(self.rank, self.size, &self.root_addr(), CONNECT_WINDOW)
    }
}

/// Root's broadcast value, or why root could not produce one
#[derive(Serialize, Deserialize)]
enum Envelope<T> {
    Value(T),
    Failed(String),
}

/// Typed collectives over a [`Communicator`]
pub struct Coordinator {
    comm: Box<dyn Communicator>,
    keep_workers_alive: bool,
    released: bool,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .field("keep_workers_alive", &self.keep_workers_alive)
            .field("released", &self.released)
            .finish()
    }
}

impl Coordinator {
    /// Wrap a communicator
    ///
    /// Unless `keep_workers_alive` is set, non-root ranks are released after
    /// their first gather contribution.
    pub fn new(comm: Box<dyn Communicator>, keep_workers_alive: bool) -> Self {
        Self {
            comm,
            keep_workers_alive,
            released: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == ROOT
    }

    /// Whether this rank has nothing left to do
    pub fn is_released(&self) -> bool {
        self.released
    }

    fn ensure_active(&self) -> CommResult<()> {
        if self.released {
            Err(CommError::Released(self.rank()))
        } else {
            Ok(())
        }
    }

    /// Compute a value on root and share it with every rank
    ///
    /// `f` runs on root only. If it fails, root returns its error and every
    /// other rank gets [`CommError::RootFailed`].
    pub fn broadcast_with<T, E, F>(&mut self, f: F) -> Result<T, TrajparError>
    where
        T: Serialize + DeserializeOwned,
        E: Into<TrajparError>,
        F: FnOnce() -> Result<T, E>,
    {
        self.ensure_active()?;
        if self.is_root() {
            match f() {
                Ok(value) => {
                    let bytes = bincode::serialize(&Envelope::Value(&value))
                        .map_err(CommError::from)?;
                    self.comm.broadcast_bytes(ROOT, Some(bytes))?;
                    Ok(value)
                }
                Err(e) => {
                    let err: TrajparError = e.into();
                    let bytes = bincode::serialize(&Envelope::<()>::Failed(err.to_string()))
                        .map_err(CommError::from)?;
                    self.comm.broadcast_bytes(ROOT, Some(bytes))?;
                    Err(err)
                }
            }
        } else {
            let bytes = self.comm.broadcast_bytes(ROOT, None)?;
            match bincode::deserialize::<Envelope<T>>(&bytes).map_err(CommError::from)? {
                Envelope::Value(value) => Ok(value),
                Envelope::Failed(reason) => Err(CommError::RootFailed(reason).into()),
            }
        }
    }

    /// Broadcast a value root already holds
    pub fn broadcast<T>(&mut self, value: Option<T>) -> Result<T, TrajparError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.broadcast_with(|| {
            value.ok_or_else(|| CommError::Protocol("root has no value to broadcast".into()))
        })
    }

    /// Collect every rank's value on root, in rank order
    pub fn gather<T>(&mut self, value: &T) -> CommResult<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ensure_active()?;
        let bytes = bincode::serialize(value)?;
        let gathered = self.comm.gather_bytes(ROOT, bytes)?;

        let Some(parts) = gathered else {
            if !self.keep_workers_alive {
                debug!(rank = self.rank(), "Released after gather");
                self.released = true;
            }
            return Ok(None);
        };

        parts
            .iter()
            .map(|p| bincode::deserialize(p).map_err(CommError::from))
            .collect::<CommResult<Vec<T>>>()
            .map(Some)
    }
}
