use std::path::PathBuf;

use dendrimer_core::BranchId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmrError {
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] dendrimer_core::Error),

    #[error("Branch not found: {0}")]
    UnknownBranch(BranchId),
}
