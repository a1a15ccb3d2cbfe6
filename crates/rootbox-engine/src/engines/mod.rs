//! Concrete execution engines, one per mechanism family.
//!
//! Every engine embeds [`ExecutionEngineCommon`](crate::base::
//! ExecutionEngineCommon) for the shared setup pipeline and only adds
//! command-line and environment assembly for its backend.

pub mod fakechroot;
pub mod proot;
pub mod runc;
pub mod singularity;

pub use fakechroot::FakechrootEngine;
pub use proot::ProotEngine;
pub use runc::RuncEngine;
pub use singularity::SingularityEngine;

use crate::base::RunOptions;
use crate::config::Config;
use crate::EngineError;
use std::path::PathBuf;
use tracing::error;

/// A backend able to execute a prepared container.
///
/// `run` performs the whole lifecycle: shared setup, backend-specific
/// assembly, child execution, and cleanup. It returns the child's exit
/// code; failures before the child starts surface as errors and are
/// mapped to an exit code by [`exit_status`].
pub trait ExecutionEngine {
    fn run(&mut self, container_id: &str) -> Result<i32, EngineError>;
}

/// Instantiate the engine serving a given execution mode.
pub fn engine_for(
    mode: &str,
    config: &Config,
    opts: RunOptions,
) -> Result<Box<dyn ExecutionEngine>, EngineError> {
    match mode.as_bytes().first() {
        Some(b'P') => Ok(Box::new(ProotEngine::new(config, opts, mode))),
        Some(b'F') => Ok(Box::new(FakechrootEngine::new(config, opts, mode))),
        Some(b'R') => Ok(Box::new(RuncEngine::new(config, opts))),
        Some(b'S') => Ok(Box::new(SingularityEngine::new(config, opts))),
        _ => Err(EngineError::InvalidMode(mode.to_owned())),
    }
}

/// Map a run outcome onto the process exit code.
///
/// 0..255 from the child itself, 2 for setup failures, 4 when a backend
/// executable or runtime spec is missing, 5 for an unusable environment.
pub fn exit_status(result: Result<i32, EngineError>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            match e {
                EngineError::MissingExecutable(_) => 4,
                EngineError::InvalidEnvironment(_) => 5,
                _ => 2,
            }
        }
    }
}

/// Locate `name` in the host `$PATH`.
pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// First cpu-affinity wrapper from `tools` whose binary is on `$PATH`,
/// with `%s` replaced by the requested cpu list.
pub(crate) fn affinity_prefix(tools: &[Vec<String>], cpuset: &str) -> Vec<String> {
    for tool in tools {
        let Some(exec) = tool.first() else {
            continue;
        };
        if find_in_path(exec).is_some() {
            return tool
                .iter()
                .map(|arg| arg.replace("%s", cpuset))
                .collect();
        }
    }
    Vec::new()
}

/// Exit code of a finished child, 2 when it died to a signal.
pub(crate) fn child_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(2)
}
