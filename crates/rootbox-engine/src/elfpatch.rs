use crate::EngineError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Call interface to the ELF-header patching collaborator.
///
/// Loader-injection modes (F2–F4) need the container's dynamic loader and,
/// for F3/F4, its binaries rewritten so interpreter references resolve
/// inside the container tree without a chroot. The patching algorithm
/// itself is external; the execution layer only drives these operations
/// and reads back the two paths it needs for environment construction.
pub trait ElfPatcher {
    fn patch_loader(&self) -> Result<(), EngineError>;
    fn patch_binaries(&self) -> Result<(), EngineError>;
    fn restore_loader(&self) -> Result<(), EngineError>;
    fn restore_binaries(&self) -> Result<(), EngineError>;
    /// Compute and persist the container's library search directories.
    fn cache_ld_dirs(&self, force: bool) -> Result<(), EngineError>;
    /// Colon-joined library search path from the cached directory list.
    fn ld_library_path(&self) -> Result<String, EngineError>;
    /// In-container absolute path of the dynamic loader.
    fn container_loader_path(&self) -> Result<String, EngineError>;
}

/// File recording the cached library directories, next to ROOT.
const LD_DIRS_FILE: &str = "ld.lib.dirs";

/// `ElfPatcher` implementation shelling out to an external `patchelf`
/// binary (the udocker-patched build that understands `--set-root-prefix`
/// and `--restore-root-prefix`).
pub struct PatchElfTool {
    container_dir: PathBuf,
    root: PathBuf,
    patchelf: PathBuf,
}

impl PatchElfTool {
    pub fn new(
        container_dir: impl Into<PathBuf>,
        patchelf: impl Into<PathBuf>,
    ) -> Self {
        let container_dir = container_dir.into();
        Self {
            root: container_dir.join(rootbox_store::layout::ROOT_SUBDIR),
            container_dir,
            patchelf: patchelf.into(),
        }
    }

    fn run_patchelf(&self, args: &[&str]) -> Result<(), EngineError> {
        if !self.patchelf.is_file() {
            return Err(EngineError::MissingExecutable(format!(
                "patchelf not found at {}",
                self.patchelf.display()
            )));
        }
        debug!("patchelf {}", args.join(" "));
        let output = Command::new(&self.patchelf).args(args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Setup(format!(
                "patchelf failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Locate the dynamic loader inside the container tree.
    fn find_loader(&self) -> Option<PathBuf> {
        for libdir in ["lib64", "lib", "usr/lib64", "usr/lib"] {
            let dir = self.root.join(libdir);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if (name.starts_with("ld-linux") || name.starts_with("ld-musl"))
                    && name.contains(".so")
                {
                    return Some(entry.path());
                }
            }
        }
        None
    }

    fn ld_dirs_file(&self) -> PathBuf {
        self.container_dir.join(LD_DIRS_FILE)
    }
}

impl ElfPatcher for PatchElfTool {
    fn patch_loader(&self) -> Result<(), EngineError> {
        let loader = self.find_loader().ok_or_else(|| {
            EngineError::Setup("no dynamic loader found in container".to_owned())
        })?;
        let root = self.root.to_string_lossy().into_owned();
        self.run_patchelf(&[
            "--set-root-prefix",
            &root,
            &loader.to_string_lossy(),
        ])
    }

    fn patch_binaries(&self) -> Result<(), EngineError> {
        let loader = self.find_loader().ok_or_else(|| {
            EngineError::Setup("no dynamic loader found in container".to_owned())
        })?;
        let loader = loader.to_string_lossy().into_owned();
        let root = self.root.to_string_lossy().into_owned();
        self.run_patchelf(&["--set-root-prefix", &root, "--update-interpreter", &loader])
    }

    fn restore_loader(&self) -> Result<(), EngineError> {
        let loader = self.find_loader().ok_or_else(|| {
            EngineError::Setup("no dynamic loader found in container".to_owned())
        })?;
        let root = self.root.to_string_lossy().into_owned();
        self.run_patchelf(&[
            "--restore-root-prefix",
            &root,
            &loader.to_string_lossy(),
        ])
    }

    fn restore_binaries(&self) -> Result<(), EngineError> {
        let loader = self.find_loader().ok_or_else(|| {
            EngineError::Setup("no dynamic loader found in container".to_owned())
        })?;
        let loader = loader.to_string_lossy().into_owned();
        let root = self.root.to_string_lossy().into_owned();
        self.run_patchelf(&[
            "--restore-root-prefix",
            &root,
            "--update-interpreter",
            &loader,
        ])
    }

    fn cache_ld_dirs(&self, force: bool) -> Result<(), EngineError> {
        let cache = self.ld_dirs_file();
        if cache.is_file() && !force {
            return Ok(());
        }
        let mut dirs = Vec::new();
        collect_lib_dirs(&self.root, &self.root, &mut dirs, 0);
        dirs.sort();
        fs::write(&cache, dirs.join("\n"))?;
        debug!("cached {} library dirs", dirs.len());
        Ok(())
    }

    fn ld_library_path(&self) -> Result<String, EngineError> {
        let cache = self.ld_dirs_file();
        if !cache.is_file() {
            self.cache_ld_dirs(false)?;
        }
        let content = fs::read_to_string(self.ld_dirs_file())?;
        Ok(content.lines().collect::<Vec<_>>().join(":"))
    }

    fn container_loader_path(&self) -> Result<String, EngineError> {
        let loader = self.find_loader().ok_or_else(|| {
            EngineError::Setup("no dynamic loader found in container".to_owned())
        })?;
        let rel = loader
            .strip_prefix(&self.root)
            .map_err(|_| EngineError::Setup("loader outside container root".to_owned()))?;
        Ok(format!("/{}", rel.display()))
    }
}

/// Host directories under ROOT containing shared objects, depth-limited.
fn collect_lib_dirs(root: &Path, dir: &Path, out: &mut Vec<String>, depth: u32) {
    if depth > 4 {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut has_so = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_lib_dirs(root, &path, out, depth + 1);
        } else if !has_so {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(".so") {
                has_so = true;
            }
        }
    }
    if has_so {
        out.push(dir.to_string_lossy().into_owned());
    }
}

/// Recording fake patcher for state-machine tests.
#[derive(Default)]
pub struct MockPatcher {
    pub calls: std::cell::RefCell<Vec<&'static str>>,
    pub fail_on: Option<&'static str>,
}

impl MockPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(op: &'static str) -> Self {
        Self {
            calls: std::cell::RefCell::new(Vec::new()),
            fail_on: Some(op),
        }
    }

    fn record(&self, op: &'static str) -> Result<(), EngineError> {
        self.calls.borrow_mut().push(op);
        if self.fail_on == Some(op) {
            warn!("mock patcher failing on {op}");
            return Err(EngineError::Setup(format!("mock failure in {op}")));
        }
        Ok(())
    }
}

impl ElfPatcher for MockPatcher {
    fn patch_loader(&self) -> Result<(), EngineError> {
        self.record("patch_loader")
    }
    fn patch_binaries(&self) -> Result<(), EngineError> {
        self.record("patch_binaries")
    }
    fn restore_loader(&self) -> Result<(), EngineError> {
        self.record("restore_loader")
    }
    fn restore_binaries(&self) -> Result<(), EngineError> {
        self.record("restore_binaries")
    }
    fn cache_ld_dirs(&self, _force: bool) -> Result<(), EngineError> {
        self.record("cache_ld_dirs")
    }
    fn ld_library_path(&self) -> Result<String, EngineError> {
        self.record("ld_library_path")?;
        Ok("/lib:/usr/lib".to_owned())
    }
    fn container_loader_path(&self) -> Result<String, EngineError> {
        self.record("container_loader_path")?;
        Ok("/lib/ld-linux-x86-64.so.2".to_owned())
    }
}
