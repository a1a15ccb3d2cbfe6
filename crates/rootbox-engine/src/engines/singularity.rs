use crate::base::{ExecutionEngineCommon, RunOptions};
use crate::config::Config;
use crate::engines::{child_code, find_in_path, ExecutionEngine};
use crate::EngineError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Engine delegating execution to singularity or apptainer (mode S1),
/// using the unpacked rootfs as a sandbox directory.
pub struct SingularityEngine {
    common: ExecutionEngineCommon,
}

impl SingularityEngine {
    pub fn new(config: &Config, opts: RunOptions) -> Self {
        Self {
            common: ExecutionEngineCommon::new(config, opts),
        }
    }

    fn select_executable(&self) -> Result<PathBuf, EngineError> {
        if let Some(exec) = &self.common.config.singularity_exec {
            let path = PathBuf::from(exec);
            if path.is_file() {
                return Ok(path);
            }
            return Err(EngineError::MissingExecutable(format!(
                "configured singularity not found: {exec}"
            )));
        }
        find_in_path("singularity")
            .or_else(|| find_in_path("apptainer"))
            .ok_or_else(|| {
                EngineError::MissingExecutable(
                    "neither singularity nor apptainer found in $PATH".to_owned(),
                )
            })
    }

    /// Running as uid 0 needs `--fakeroot`, which in turn needs a subuid
    /// range assigned to the invoking user.
    fn fakeroot_allowed(&self, subuid: &Path) -> bool {
        let Ok(content) = fs::read_to_string(subuid) else {
            return false;
        };
        let prefix = format!("{}:", self.common.host.username);
        content.lines().any(|line| line.starts_with(&prefix))
    }

    fn assemble(&self, exec: &Path, fakeroot: bool) -> Vec<String> {
        let opts = &self.common.opts;
        let mut argv = vec![
            exec.to_string_lossy().into_owned(),
            "-q".to_owned(),
            "exec".to_owned(),
            "--cleanenv".to_owned(),
        ];
        if fakeroot {
            argv.push("--fakeroot".to_owned());
        }
        argv.push("--pwd".to_owned());
        argv.push(opts.cwd.clone());
        argv.push("--home".to_owned());
        argv.push(opts.home.clone());
        for (host, container) in &opts.vol {
            argv.push("-B".to_owned());
            argv.push(format!("{host}:{container}"));
        }
        argv.push(self.common.root.to_string_lossy().into_owned());
        argv.extend(opts.cmd.iter().cloned());
        argv
    }
}

impl ExecutionEngine for SingularityEngine {
    fn run(&mut self, container_id: &str) -> Result<i32, EngineError> {
        self.common.run_init(container_id)?;
        let exec = self.select_executable()?;

        let mut fakeroot = false;
        if self.common.opts.uid == 0 && !self.common.host.is_root() {
            if self.fakeroot_allowed(Path::new("/etc/subuid")) {
                fakeroot = true;
            } else {
                warn!(
                    "no subuid range for {}, running as the invoking user",
                    self.common.host.username
                );
                self.common.opts.uid = self.common.host.uid;
                self.common.opts.gid = self.common.host.gid;
            }
        }

        let argv = self.assemble(&exec, fakeroot);
        info!("{}", argv.join(" "));

        // --cleanenv strips the environment; the container values travel
        // through SINGULARITYENV_* on top of the invoking environment.
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (key, value) in self.common.build_env() {
            cmd.env(format!("SINGULARITYENV_{key}"), value);
        }
        let status = cmd.status()?;
        Ok(child_code(status))
    }
}
