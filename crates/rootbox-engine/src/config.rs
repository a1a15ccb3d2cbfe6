use crate::EngineError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Read-only settings consumed by the execution layer.
///
/// Constructed once in `main` and passed by reference into constructors;
/// there is no mutable global. A TOML file can override individual fields
/// on top of the defaults via [`Config::load_overlay`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Top directory of the local repository (`containers/` lives here).
    pub topdir: PathBuf,
    /// Directory for temporary files (FileBind holding dirs, synthesized
    /// passwd/group fragments, fakechroot AF_UNIX sockets).
    pub tmpdir: PathBuf,
    /// Directory holding bundled tools: proot binaries, libfakechroot
    /// builds, the patchelf helper.
    pub lib_dir: PathBuf,

    /// Mode used when a container has no persisted `execmode` file.
    pub default_mode: String,
    /// Command used when neither the image nor the CLI provides one.
    pub default_cmd: Vec<String>,

    /// Host directories bound into every container unless disabled.
    pub sysdirs: Vec<String>,
    /// Host files bound when host authentication is requested.
    pub hostauth_files: Vec<String>,
    /// DRI directories bound for GPU access unless disabled.
    pub dri_dirs: Vec<String>,
    /// Device paths injected when NVIDIA mode is active.
    pub nvidia_devices: Vec<String>,
    /// Container paths probed on the host and whitelisted for `access()`
    /// under fakechroot (HPC interconnect devices some libraries stat
    /// unconditionally).
    pub access_files: Vec<String>,

    /// Host environment variables imported into the container.
    pub valid_host_env: Vec<String>,
    /// Host environment variables never imported, even if listed above.
    pub invalid_host_env: Vec<String>,

    /// Per-engine executable overrides. When unset the engine searches
    /// `$PATH` and then `lib_dir`.
    pub proot_exec: Option<String>,
    pub fakechroot_so: Option<String>,
    pub runc_exec: Option<String>,
    pub singularity_exec: Option<String>,
    pub patchelf_exec: Option<String>,

    /// CPU-affinity wrappers tried in order; `%s` is replaced with the
    /// requested cpu list.
    pub cpu_affinity_exec_tools: Vec<Vec<String>>,

    /// Pass `--kill-on-exit` to proot when the binary supports it.
    pub proot_killonexit: bool,
    /// Kernel version reported to the sandboxed process (`proot -k`).
    /// Some guest distributions refuse to run on kernels they predate,
    /// so the reported version is spoofed to a known-good value.
    pub kernel_spoof: String,
    /// Below this host kernel the `mqueue` mount is dropped from the
    /// runc spec (rootless mqueue mounts fail on older kernels).
    pub runc_nomqueue_kernel: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
        let topdir = PathBuf::from(&home).join(".rootbox");
        Self {
            tmpdir: std::env::temp_dir(),
            lib_dir: topdir.join("lib"),
            topdir,
            default_mode: "P1".to_owned(),
            default_cmd: vec!["/bin/bash".to_owned()],
            sysdirs: vec![
                "/dev".to_owned(),
                "/proc".to_owned(),
                "/sys".to_owned(),
                "/etc/resolv.conf".to_owned(),
                "/etc/host.conf".to_owned(),
                "/lib/modules".to_owned(),
            ],
            hostauth_files: vec!["/etc/passwd".to_owned(), "/etc/group".to_owned()],
            dri_dirs: vec!["/usr/lib64/dri".to_owned(), "/usr/lib/dri".to_owned()],
            nvidia_devices: vec![
                "/dev/nvidia0".to_owned(),
                "/dev/nvidiactl".to_owned(),
                "/dev/nvidia-modeset".to_owned(),
                "/dev/nvidia-uvm".to_owned(),
            ],
            access_files: vec![
                "/sys/class/infiniband".to_owned(),
                "/dev/open-mx".to_owned(),
                "/dev/myri0".to_owned(),
                "/dev/ipath".to_owned(),
                "/dev/kgni0".to_owned(),
            ],
            valid_host_env: vec![
                "TERM".to_owned(),
                "PATH".to_owned(),
                "LANG".to_owned(),
                "DISPLAY".to_owned(),
            ],
            invalid_host_env: vec!["VTE_VERSION".to_owned(), "LD_PRELOAD".to_owned()],
            proot_exec: None,
            fakechroot_so: None,
            runc_exec: None,
            singularity_exec: None,
            patchelf_exec: None,
            cpu_affinity_exec_tools: vec![
                vec![
                    "numactl".to_owned(),
                    "-C".to_owned(),
                    "%s".to_owned(),
                    "--".to_owned(),
                ],
                vec!["taskset".to_owned(), "-c".to_owned(), "%s".to_owned()],
            ],
            proot_killonexit: true,
            kernel_spoof: "4.8.13".to_owned(),
            runc_nomqueue_kernel: "4.8.0".to_owned(),
        }
    }
}

impl Config {
    /// Defaults overlaid with the TOML file at `path`, if it exists.
    /// Unknown keys in the file are rejected so typos surface early.
    pub fn load_overlay(path: &Path) -> Result<Self, EngineError> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Setup(format!("bad config {}: {e}", path.display())))
    }
}
