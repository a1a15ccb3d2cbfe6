//! Execution layer for rootbox containers.
//!
//! This crate maps one logical "run this container" request onto four
//! structurally different isolation mechanisms: ptrace interception
//! (proot), dynamic-loader injection (fakechroot), OCI namespaces (runc),
//! and a third-party engine (singularity). The shared setup pipeline lives
//! in [`base::ExecutionEngineCommon`]; the persisted per-container mode
//! and the transitions between mechanism families live in
//! [`execmode::ExecMode`].

pub mod base;
pub mod config;
pub mod elfpatch;
pub mod engines;
pub mod execmode;
pub mod filebind;
pub mod hostinfo;
pub mod identity;
pub mod links;
pub mod pathtrans;
pub mod pty;

pub use base::{ExecutionEngineCommon, RunOptions};
pub use config::Config;
pub use engines::ExecutionEngine;
pub use execmode::ExecMode;
pub use hostinfo::HostInfo;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] rootbox_store::StoreError),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("executable or runtime spec not found: {0}")]
    MissingExecutable(String),
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),
    #[error("invalid execution mode '{0}'")]
    InvalidMode(String),
    #[error("mode transition {from} -> {to} failed: {reason}")]
    Transition {
        from: String,
        to: String,
        reason: String,
    },
}
