use std::time::Duration;

use thiserror::Error;

// Everything that can stop a generation run or a pool from starting.
// Configuration errors are raised before any cell is written.
#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("dimension {0} is not 2^n + 1 with n >= 1")]
    InvalidDimension(usize),

    #[error("invalid seed map: {0}")]
    InvalidSeedMap(String),

    #[error("no seed map was supplied before generate()")]
    MissingSeedMap,

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("seed image must be square, got {width}x{height}")]
    Image { width: u32, height: u32 },

    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("parallel backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("worker pool did not finish phase within {0:?}")]
    SyncTimeout(Duration),

    #[error("worker pool has been cancelled")]
    PoolCancelled,
}

pub type Result<T> = std::result::Result<T, TerrainError>;
