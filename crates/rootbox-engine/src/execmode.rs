use crate::elfpatch::ElfPatcher;
use crate::filebind::FileBind;
use crate::links::links_conv;
use crate::EngineError;
use rootbox_store::layout::ROOT_SUBDIR;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// File next to ROOT recording the committed execution mode.
pub const EXECMODE_FILE: &str = "execmode";
/// File next to ROOT recording the real ROOT path at commit time, so a
/// container moved on disk can still convert its symlinks back.
pub const ROOTPATH_FILE: &str = "root.path";

pub const VALID_MODES: [&str; 8] = ["P1", "P2", "F1", "F2", "F3", "F4", "R1", "S1"];

/// One tree conversion performed during a mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStep {
    RestoreFileBind,
    SetupFileBind,
    LinksToIndirect,
    LinksToDirect,
    CacheLdDirs,
    PatchLoader,
    PatchBinaries,
    RestoreLoader,
    RestoreBinaries,
}

fn is_loader_patched(mode: &str) -> bool {
    matches!(mode, "F2" | "F3" | "F4")
}

fn uses_filebind(mode: &str) -> bool {
    matches!(mode, "R1" | "S1")
}

/// Ordered conversion steps turning a tree committed for `from` into one
/// valid for `to`. Pure; no filesystem access.
///
/// With `force` the patch steps are emitted even when the target family
/// already matches, so a damaged tree can be re-patched in place.
pub fn transition_plan(from: &str, to: &str, force: bool) -> Vec<ConvStep> {
    let mut steps = Vec::new();
    if from == to && !force {
        return steps;
    }
    if uses_filebind(from) && !uses_filebind(to) {
        steps.push(ConvStep::RestoreFileBind);
    }
    // All fakechroot flavours run without a chroot, so absolute symlinks
    // must point at the host path of ROOT and the library directory list
    // must be cached for LD_LIBRARY_PATH construction. A tree already in
    // the F family has both.
    if to.starts_with('F') && (!from.starts_with('F') || force) {
        steps.push(ConvStep::LinksToIndirect);
        steps.push(ConvStep::CacheLdDirs);
    }
    match to {
        "P1" | "P2" | "F1" | "R1" | "S1" => {
            if is_loader_patched(from) {
                steps.push(ConvStep::RestoreLoader);
                steps.push(ConvStep::RestoreBinaries);
            }
            // Leaving the F family for a chrooted engine needs the
            // symlink layout converted back, patched loader or not.
            if from.starts_with('F') && !to.starts_with('F') {
                steps.push(ConvStep::LinksToDirect);
            }
            if uses_filebind(to) && !uses_filebind(from) {
                steps.push(ConvStep::SetupFileBind);
            }
        }
        "F2" => {
            if matches!(from, "F3" | "F4") {
                steps.push(ConvStep::RestoreBinaries);
            }
            if !is_loader_patched(from) || force {
                steps.push(ConvStep::PatchLoader);
            }
        }
        "F3" | "F4" => {
            if !matches!(from, "F3" | "F4") || force {
                steps.push(ConvStep::PatchLoader);
                steps.push(ConvStep::PatchBinaries);
            }
        }
        _ => {}
    }
    steps
}

/// Persisted per-container execution mode.
///
/// The committed mode lives in [`EXECMODE_FILE`]; changing it converts the
/// rootfs between layouts first and persists only on success, except under
/// `force` where the new mode is committed even after partial failure.
pub struct ExecMode<'a> {
    container_dir: PathBuf,
    root: PathBuf,
    default_mode: String,
    patcher: &'a dyn ElfPatcher,
}

impl<'a> ExecMode<'a> {
    pub fn new(
        container_dir: impl Into<PathBuf>,
        default_mode: &str,
        patcher: &'a dyn ElfPatcher,
    ) -> Self {
        let container_dir = container_dir.into();
        Self {
            root: container_dir.join(ROOT_SUBDIR),
            container_dir,
            default_mode: default_mode.to_owned(),
            patcher,
        }
    }

    fn mode_file(&self) -> PathBuf {
        self.container_dir.join(EXECMODE_FILE)
    }

    fn root_path_file(&self) -> PathBuf {
        self.container_dir.join(ROOTPATH_FILE)
    }

    /// Committed mode, or the configured default when none is recorded.
    pub fn get_mode(&self) -> String {
        match fs::read_to_string(self.mode_file()) {
            Ok(content) => {
                let mode = content.trim().to_owned();
                if VALID_MODES.contains(&mode.as_str()) {
                    mode
                } else {
                    warn!("ignoring invalid persisted mode '{mode}'");
                    self.default_mode.clone()
                }
            }
            Err(_) => self.default_mode.clone(),
        }
    }

    /// ROOT real path recorded at the last commit, if any.
    pub fn orig_root(&self) -> Option<PathBuf> {
        let content = fs::read_to_string(self.root_path_file()).ok()?;
        let trimmed = content.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Convert the container tree to `to` and commit the new mode.
    ///
    /// Without `force` the first failing conversion aborts and leaves the
    /// committed mode untouched; the tree may be partially converted. With
    /// `force` failures are logged, remaining steps still run, and the new
    /// mode is committed regardless.
    pub fn set_mode(&self, to: &str, force: bool) -> Result<(), EngineError> {
        if !VALID_MODES.contains(&to) {
            return Err(EngineError::InvalidMode(to.to_owned()));
        }
        let from = self.get_mode();
        let steps = transition_plan(&from, to, force);
        if steps.is_empty() && from == to {
            return Ok(());
        }
        info!("changing execution mode {from} -> {to}");

        let mut failure: Option<EngineError> = None;
        for step in steps {
            if let Err(e) = self.apply(step, force) {
                if force {
                    warn!("mode conversion step {step:?} failed, continuing: {e}");
                    failure.get_or_insert(e);
                } else {
                    return Err(EngineError::Transition {
                        from,
                        to: to.to_owned(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.persist(to)?;
        if let Some(e) = failure {
            warn!("mode {to} committed with errors: {e}");
        }
        Ok(())
    }

    fn apply(&self, step: ConvStep, force: bool) -> Result<(), EngineError> {
        let orig_root = self.orig_root();
        match step {
            ConvStep::RestoreFileBind => {
                FileBind::new(&self.container_dir).restore();
                Ok(())
            }
            ConvStep::SetupFileBind => FileBind::new(&self.container_dir).setup(),
            ConvStep::LinksToIndirect => {
                links_conv(&self.root, orig_root.as_deref(), true, force)
            }
            ConvStep::LinksToDirect => {
                links_conv(&self.root, orig_root.as_deref(), false, force)
            }
            ConvStep::CacheLdDirs => self.patcher.cache_ld_dirs(force),
            ConvStep::PatchLoader => self.patcher.patch_loader(),
            ConvStep::PatchBinaries => self.patcher.patch_binaries(),
            ConvStep::RestoreLoader => self.patcher.restore_loader(),
            ConvStep::RestoreBinaries => self.patcher.restore_binaries(),
        }
    }

    fn persist(&self, mode: &str) -> Result<(), EngineError> {
        fs::write(self.mode_file(), mode)?;
        let real_root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        fs::write(self.root_path_file(), real_root.to_string_lossy().as_bytes())?;
        Ok(())
    }
}
