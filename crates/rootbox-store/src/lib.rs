//! Local container repository for rootbox.
//!
//! This crate owns the on-disk layout of extracted containers: one
//! directory per container id holding the unpacked rootfs (`ROOT`), the
//! image metadata JSON (`container.json`), and human-readable name aliases
//! implemented as sibling symlinks. The execution layer consumes it
//! read-mostly; the only files it writes back live next to `ROOT`
//! (`execmode`, `root.path`, `config.json`, `osenv.json`).

pub mod layout;
pub mod metadata;

pub use layout::LocalRepository;
pub use metadata::{ContainerMetadata, ImageConfig, StrOrList};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("container '{0}' not found in the local repository")]
    ContainerNotFound(String),
    #[error("container name '{0}' is invalid or already taken")]
    BadName(String),
}
