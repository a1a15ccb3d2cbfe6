use crate::base::{ExecutionEngineCommon, RunOptions};
use crate::config::Config;
use crate::engines::{affinity_prefix, child_code, find_in_path, ExecutionEngine};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Cached probe results next to ROOT, keyed by kernel and architecture so
/// a container copied between hosts re-probes.
const OSENV_FILE: &str = "osenv.json";

#[derive(Debug, Serialize, Deserialize)]
struct OsEnv {
    kernel: String,
    arch: String,
    proot_noseccomp: bool,
}

/// Engine running the container under ptrace interception (modes P1/P2).
///
/// P1 lets proot use its seccomp-BPF accelerator when the binary and the
/// host kernel cooperate; P2 always disables it (`PROOT_NO_SECCOMP`),
/// which is slower but survives kernels with broken filter handling.
pub struct ProotEngine {
    common: ExecutionEngineCommon,
    mode: String,
}

impl ProotEngine {
    pub fn new(config: &Config, opts: RunOptions, mode: &str) -> Self {
        Self {
            common: ExecutionEngineCommon::new(config, opts),
            mode: mode.to_owned(),
        }
    }

    /// Pick the proot binary: configured override, then `$PATH`, then the
    /// bundled builds in `lib_dir`.
    fn select_proot(&self) -> Result<PathBuf, EngineError> {
        if let Some(exec) = &self.common.config.proot_exec {
            let path = PathBuf::from(exec);
            if path.is_file() {
                return Ok(path);
            }
            return Err(EngineError::MissingExecutable(format!(
                "configured proot not found: {exec}"
            )));
        }
        if let Some(path) = find_in_path("proot") {
            return Ok(path);
        }
        let arch = &self.common.host.arch;
        for name in [format!("proot-{arch}-4_8_0"), format!("proot-{arch}")] {
            let candidate = self.common.config.lib_dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(EngineError::MissingExecutable(
            "proot not found in $PATH or the tool library".to_owned(),
        ))
    }

    /// Whether seccomp acceleration must be disabled on this host.
    ///
    /// Probed by running the selected binary against the host root once
    /// normally and once with `PROOT_NO_SECCOMP=1`; the result is cached
    /// in `osenv.json` until the kernel or architecture changes.
    fn needs_noseccomp(&self, proot: &Path) -> bool {
        if self.mode == "P2" {
            return true;
        }
        let cache = self.common.container_dir.join(OSENV_FILE);
        if let Ok(content) = fs::read_to_string(&cache) {
            if let Ok(env) = serde_json::from_str::<OsEnv>(&content) {
                if env.kernel == self.common.host.kernel && env.arch == self.common.host.arch {
                    return env.proot_noseccomp;
                }
            }
        }

        let probe = |noseccomp: bool| -> bool {
            let mut cmd = Command::new(proot);
            cmd.args(["-r", "/", "/usr/bin/env", "true"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if noseccomp {
                cmd.env("PROOT_NO_SECCOMP", "1");
            }
            cmd.status().map(|s| s.success()).unwrap_or(false)
        };
        let noseccomp = !probe(false) && probe(true);
        if noseccomp {
            warn!("seccomp acceleration unusable on this kernel, disabling");
        }
        let env = OsEnv {
            kernel: self.common.host.kernel.clone(),
            arch: self.common.host.arch.clone(),
            proot_noseccomp: noseccomp,
        };
        if let Ok(json) = serde_json::to_string_pretty(&env) {
            if let Err(e) = fs::write(&cache, json) {
                debug!("cannot cache probe result: {e}");
            }
        }
        noseccomp
    }

    /// The patched proot builds grow a `--kill-on-exit` flag; detect it
    /// from the help text.
    fn supports_killonexit(&self, proot: &Path) -> bool {
        let Ok(output) = Command::new(proot).arg("--help").output() else {
            return false;
        };
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        text.contains("kill-on-exit")
    }

    fn assemble(&self, proot: &Path) -> Vec<String> {
        let opts = &self.common.opts;
        let mut argv = Vec::new();
        if let Some(cpuset) = &opts.cpuset {
            argv.extend(affinity_prefix(
                &self.common.config.cpu_affinity_exec_tools,
                cpuset,
            ));
        }
        argv.push(proot.to_string_lossy().into_owned());
        if tracing::enabled!(tracing::Level::DEBUG) {
            argv.push("-v".to_owned());
            argv.push("2".to_owned());
        }
        if self.common.config.proot_killonexit && self.supports_killonexit(proot) {
            argv.push("--kill-on-exit".to_owned());
        }
        for (host, container) in &opts.vol {
            argv.push("-b".to_owned());
            argv.push(format!("{host}:{container}"));
        }
        if opts.uid == 0 {
            argv.push("-0".to_owned());
        } else {
            argv.push("-i".to_owned());
            argv.push(format!("{}:{}", opts.uid, opts.gid));
        }
        argv.push("-k".to_owned());
        argv.push(
            opts.kernel
                .clone()
                .unwrap_or_else(|| self.common.config.kernel_spoof.clone()),
        );
        for (host_port, cont_port) in &opts.portsmap {
            argv.push("-p".to_owned());
            argv.push(format!("{host_port}:{cont_port}"));
        }
        if opts.netcoop {
            argv.push("-n".to_owned());
        }
        argv.push("-r".to_owned());
        argv.push(self.common.root.to_string_lossy().into_owned());
        argv.push("-w".to_owned());
        argv.push(opts.cwd.clone());
        argv.extend(opts.cmd.iter().cloned());
        argv
    }
}

impl ExecutionEngine for ProotEngine {
    fn run(&mut self, container_id: &str) -> Result<i32, EngineError> {
        self.common.run_init(container_id)?;
        let proot = self.select_proot()?;
        let noseccomp = self.needs_noseccomp(&proot);
        let argv = self.assemble(&proot);
        info!("{}", argv.join(" "));

        let mut env = self.common.build_env();
        if noseccomp {
            env.insert("PROOT_NO_SECCOMP".to_owned(), "1".to_owned());
        } else {
            // Patched proot builds read this to enable the accelerated
            // seccomp path; unpatched builds ignore it.
            env.insert("PROOT_NEW_SECCOMP".to_owned(), "1".to_owned());
        }
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(&env)
            .status()?;
        Ok(child_code(status))
    }
}
