use crate::base::{ExecutionEngineCommon, RunOptions};
use crate::config::Config;
use crate::engines::{child_code, find_in_path, ExecutionEngine};
use crate::filebind::FileBind;
use crate::pty::Pty;
use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Runtime spec file inside the container directory (the bundle).
const SPEC_FILE: &str = "config.json";

// The OCI runtime spec, reduced to the fields this engine rewrites.
// Everything else round-trips untouched through the flattened maps.

#[derive(Debug, Serialize, Deserialize)]
struct OciSpec {
    process: OciProcess,
    root: OciRoot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(default)]
    mounts: Vec<OciMount>,
    linux: OciLinux,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OciProcess {
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    user: OciUser,
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    cwd: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OciUser {
    uid: u32,
    gid: u32,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OciRoot {
    path: String,
    #[serde(default)]
    readonly: bool,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OciMount {
    destination: String,
    #[serde(rename = "type", default)]
    mount_type: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OciLinux {
    #[serde(rename = "uidMappings", default)]
    uid_mappings: Vec<OciIdMapping>,
    #[serde(rename = "gidMappings", default)]
    gid_mappings: Vec<OciIdMapping>,
    #[serde(default)]
    devices: Vec<OciDevice>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OciIdMapping {
    #[serde(rename = "containerID")]
    container_id: u32,
    #[serde(rename = "hostID")]
    host_id: u32,
    size: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct OciDevice {
    path: String,
    #[serde(rename = "type")]
    device_type: String,
    major: u64,
    minor: u64,
}

fn dev_major(rdev: u64) -> u64 {
    ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff)
}

fn dev_minor(rdev: u64) -> u64 {
    ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff)
}

/// Engine running the container under an OCI runtime in rootless mode
/// (mode R1). Prefers `runc`, falls back to `crun`.
pub struct RuncEngine {
    common: ExecutionEngineCommon,
    filebind: Option<FileBind>,
}

impl RuncEngine {
    pub fn new(config: &Config, opts: RunOptions) -> Self {
        Self {
            common: ExecutionEngineCommon::new(config, opts),
            filebind: None,
        }
    }

    fn select_runtime(&self) -> Result<PathBuf, EngineError> {
        if let Some(exec) = &self.common.config.runc_exec {
            let path = PathBuf::from(exec);
            if path.is_file() {
                return Ok(path);
            }
            return Err(EngineError::MissingExecutable(format!(
                "configured OCI runtime not found: {exec}"
            )));
        }
        find_in_path("runc")
            .or_else(|| find_in_path("crun"))
            .ok_or_else(|| {
                EngineError::MissingExecutable("neither runc nor crun found in $PATH".to_owned())
            })
    }

    fn spec_path(&self) -> PathBuf {
        self.common.container_dir.join(SPEC_FILE)
    }

    /// Generate a fresh rootless spec in the bundle directory.
    fn bootstrap_spec(&self, runtime: &Path) -> Result<(), EngineError> {
        let output = Command::new(runtime)
            .args(["spec", "--rootless"])
            .current_dir(&self.common.container_dir)
            .output()?;
        if !output.status.success() {
            return Err(EngineError::MissingExecutable(format!(
                "cannot generate runtime spec: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn load_spec(&self) -> Result<OciSpec, EngineError> {
        let path = self.spec_path();
        if !path.is_file() {
            return Err(EngineError::MissingExecutable(format!(
                "runtime spec missing: {}",
                path.display()
            )));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    fn save_spec(&self, spec: &OciSpec) -> Result<(), EngineError> {
        fs::write(self.spec_path(), serde_json::to_string_pretty(spec)?)?;
        Ok(())
    }

    /// Rewrite the generated spec for this run.
    fn update_spec(&mut self, spec: &mut OciSpec) -> Result<(), EngineError> {
        let opts = &self.common.opts;
        spec.root.path = rootbox_store::layout::ROOT_SUBDIR.to_owned();
        spec.root.readonly = false;

        spec.process.terminal = opts.tty;
        spec.process.args = opts.cmd.clone();
        spec.process.cwd = opts.cwd.clone();
        spec.process.user.uid = opts.uid;
        spec.process.user.gid = opts.gid;
        spec.process.env = self
            .common
            .build_env()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        spec.hostname = Some(if opts.hostname.is_empty() {
            let id = &self.common.container_id;
            id[..12.min(id.len())].to_owned()
        } else {
            opts.hostname.clone()
        });

        // One-to-one mapping of the requested identity onto the invoker.
        spec.linux.uid_mappings = vec![OciIdMapping {
            container_id: opts.uid,
            host_id: self.common.host.uid,
            size: 1,
        }];
        spec.linux.gid_mappings = vec![OciIdMapping {
            container_id: opts.gid,
            host_id: self.common.host.gid,
            size: 1,
        }];

        // Rootless mqueue mounts fail on older kernels.
        if !self
            .common
            .host
            .kernel_at_least(&self.common.config.runc_nomqueue_kernel)
        {
            spec.mounts.retain(|m| m.mount_type != "mqueue");
        }

        self.add_volume_mounts(spec)?;
        self.add_devices(spec);
        Ok(())
    }

    /// Directory bindings become rbind mounts; file bindings go through
    /// one FileBind holding directory mounted at its in-container path.
    fn add_volume_mounts(&mut self, spec: &mut OciSpec) -> Result<(), EngineError> {
        let mut file_vols = Vec::new();
        for (host, container) in self.common.opts.vol.clone() {
            if Path::new(&host).is_dir() {
                spec.mounts.push(OciMount {
                    destination: container,
                    mount_type: "none".to_owned(),
                    source: host,
                    options: vec![
                        "rbind".to_owned(),
                        "nosuid".to_owned(),
                        "nodev".to_owned(),
                        "rw".to_owned(),
                    ],
                });
            } else {
                file_vols.push((host, container));
            }
        }
        if file_vols.is_empty() {
            return Ok(());
        }

        let mut bind = FileBind::new(&self.common.container_dir);
        let containers: Vec<String> = file_vols.iter().map(|(_, c)| c.clone()).collect();
        let (holding, bind_dir) = bind.start(&containers)?;
        for (host, container) in &file_vols {
            bind.add(Path::new(host), container)?;
        }
        spec.mounts.push(OciMount {
            destination: bind_dir,
            mount_type: "none".to_owned(),
            source: holding.to_string_lossy().into_owned(),
            options: vec!["rbind".to_owned(), "nodev".to_owned(), "rw".to_owned()],
        });
        self.filebind = Some(bind);
        Ok(())
    }

    fn add_devices(&self, spec: &mut OciSpec) {
        let mut devices = self.common.opts.devices.clone();
        if self.common.opts.nvidia {
            devices.extend(self.common.config.nvidia_devices.iter().cloned());
        }
        for dev in devices {
            let Ok(meta) = fs::metadata(&dev) else {
                warn!("device {dev} not present on host, skipping");
                continue;
            };
            let file_type = meta.file_type();
            let device_type = if file_type.is_char_device() {
                "c"
            } else if file_type.is_block_device() {
                "b"
            } else {
                warn!("{dev} is not a device node, skipping");
                continue;
            };
            spec.linux.devices.push(OciDevice {
                path: dev,
                device_type: device_type.to_owned(),
                major: dev_major(meta.rdev()),
                minor: dev_minor(meta.rdev()),
            });
        }
    }
}

impl ExecutionEngine for RuncEngine {
    fn run(&mut self, container_id: &str) -> Result<i32, EngineError> {
        self.common.run_init(container_id)?;
        let runtime = self.select_runtime()?;

        if self.common.opts.fresh_spec || !self.spec_path().is_file() {
            self.bootstrap_spec(&runtime)?;
        }
        let mut spec = self.load_spec()?;
        self.update_spec(&mut spec)?;
        self.save_spec(&spec)?;

        let state_root = self.common.config.tmpdir.join("rootbox-runc");
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let exec_id = format!("rootbox-{}-{nanos}", std::process::id());
        info!(
            "{} run --bundle {} {exec_id}",
            runtime.display(),
            self.common.container_dir.display()
        );

        let mut command = Command::new(&runtime);
        command
            .arg("--root")
            .arg(&state_root)
            .arg("run")
            .arg("--bundle")
            .arg(&self.common.container_dir)
            .arg(&exec_id);

        // Without a controlling terminal the child still gets one: its
        // stdio is a pty slave and the master is relayed to stdout.
        let status = if self.common.opts.tty {
            command.status()?
        } else {
            let pty = Pty::open()?;
            let slave = pty.open_slave()?;
            let mut child = command
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave))
                .spawn()?;
            pty.relay(&mut child)?
        };
        if let Some(bind) = &mut self.filebind {
            bind.finish();
        }
        Ok(child_code(status))
    }
}
