use crate::EngineError;
use rootbox_store::layout::ROOT_SUBDIR;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Host-side directory (sibling of ROOT) stashing renamed-away originals.
pub const ORIG_DIR: &str = "bind.orig";
/// In-container directory where redirected files surface.
pub const BIND_DIR: &str = "/.bind_host_files";

/// Bind-mount emulation for backends without mount namespaces.
///
/// A file is "bound" by renaming the container's copy into a hidden stash,
/// planting a symlink at its old location that points into [`BIND_DIR`],
/// and copying the original into a temporary host directory the caller
/// surfaces at [`BIND_DIR`] (a real bind mount under runc, `-B` under
/// singularity). `restore` undoes the whole arrangement.
#[derive(Debug)]
pub struct FileBind {
    container_dir: PathBuf,
    root: PathBuf,
    orig_dir: PathBuf,
    host_bind_dir: Option<PathBuf>,
}

/// Flatten a container path into a single file name (`/` becomes `#`).
fn flatten(container_file: &str) -> String {
    container_file.trim_start_matches('/').replace('/', "#")
}

fn unflatten(name: &str) -> String {
    format!("/{}", name.replace('#', "/"))
}

impl FileBind {
    pub fn new(container_dir: impl Into<PathBuf>) -> Self {
        let container_dir = container_dir.into();
        Self {
            root: container_dir.join(ROOT_SUBDIR),
            orig_dir: container_dir.join(ORIG_DIR),
            container_dir,
            host_bind_dir: None,
        }
    }

    /// In-container path a bound file is redirected to. Pure mapping.
    pub fn get_path(&self, container_file: &str) -> String {
        format!("{BIND_DIR}/{}", flatten(container_file))
    }

    /// Create the hidden directories. Fails when either cannot be created.
    pub fn setup(&self) -> Result<(), EngineError> {
        for dir in [&self.orig_dir, &self.root.join(BIND_DIR.trim_start_matches('/'))] {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Setup(format!("cannot create {}: {e}", dir.display()))
                })?;
            }
        }
        Ok(())
    }

    /// Redirect every regular file in `file_list` and return the host
    /// holding directory plus the in-container bind directory the caller
    /// must surface it at.
    pub fn start(&mut self, file_list: &[String]) -> Result<(PathBuf, String), EngineError> {
        self.setup()?;
        // a holding dir kept from an earlier start would leak
        self.finish();
        let holding = tempfile::Builder::new()
            .prefix("rootbox-bind-")
            .tempdir()?
            .keep();
        for container_file in file_list {
            let flat = flatten(container_file);
            let cont_path = self.root.join(container_file.trim_start_matches('/'));
            let orig_path = self.orig_dir.join(&flat);

            if !orig_path.exists() {
                let meta = fs::symlink_metadata(&cont_path);
                let is_regular = meta.map(|m| m.file_type().is_file()).unwrap_or(false);
                if !is_regular {
                    continue; // already redirected, or nothing to stash
                }
                fs::rename(&cont_path, &orig_path)?;
                std::os::unix::fs::symlink(self.get_path(container_file), &cont_path)?;
            }
            fs::copy(&orig_path, holding.join(&flat))?;
        }
        self.host_bind_dir = Some(holding.clone());
        Ok((holding, BIND_DIR.to_owned()))
    }

    /// Register one more host file under the started holding directory.
    pub fn add(&self, host_file: &Path, container_file: &str) -> Result<(), EngineError> {
        let Some(holding) = &self.host_bind_dir else {
            return Err(EngineError::Setup(
                "file bind not started, cannot add files".to_owned(),
            ));
        };
        fs::copy(host_file, holding.join(flatten(container_file)))?;
        Ok(())
    }

    /// Per-run cleanup: drop the holding directory but keep the stash and
    /// the in-container symlinks, which belong to the committed mode.
    pub fn finish(&mut self) {
        if let Some(holding) = self.host_bind_dir.take() {
            let _ = fs::remove_dir_all(holding);
        }
    }

    /// Undo every redirection made by `start`. Safe to call when nothing
    /// was ever started.
    pub fn restore(&mut self) {
        if let Ok(entries) = fs::read_dir(&self.orig_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let cont_path = self
                    .root
                    .join(unflatten(&name).trim_start_matches('/'));
                // Only replace dangling symlinks or missing files; a
                // regular file at the old location was put there on purpose.
                let dangling = cont_path.is_symlink() && !cont_path.exists();
                if dangling {
                    let _ = fs::remove_file(&cont_path);
                }
                if dangling || !cont_path.exists() {
                    if let Err(e) = fs::rename(entry.path(), &cont_path) {
                        warn!("cannot restore {}: {e}", cont_path.display());
                    }
                }
            }
        }
        let _ = fs::remove_dir_all(&self.orig_dir);
        let _ = fs::remove_dir_all(self.root.join(BIND_DIR.trim_start_matches('/')));
        if let Some(holding) = self.host_bind_dir.take() {
            let _ = fs::remove_dir_all(holding);
        }
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// Host path of the stashed original for a bound container file, if
    /// one exists.
    pub fn orig_file(&self, container_file: &str) -> Option<PathBuf> {
        let path = self.orig_dir.join(flatten(container_file));
        path.is_file().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, FileBind) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(ROOT_SUBDIR).join("etc")).unwrap();
        fs::write(
            dir.path().join(ROOT_SUBDIR).join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\n",
        )
        .unwrap();
        let bind = FileBind::new(dir.path());
        (dir, bind)
    }

    #[test]
    fn get_path_flattens() {
        let (_dir, bind) = fixture();
        assert_eq!(
            bind.get_path("/etc/passwd"),
            "/.bind_host_files/etc#passwd"
        );
    }

    #[test]
    fn start_redirects_and_copies() {
        let (dir, mut bind) = fixture();
        let (holding, cont_bind) = bind.start(&["/etc/passwd".to_owned()]).unwrap();
        assert_eq!(cont_bind, BIND_DIR);

        let cont_path = dir.path().join(ROOT_SUBDIR).join("etc/passwd");
        assert!(cont_path.is_symlink());
        assert!(holding.join("etc#passwd").is_file());
        assert!(bind.orig_file("/etc/passwd").is_some());
        bind.restore();
    }

    #[test]
    fn round_trip_restores_byte_identical_file() {
        let (dir, mut bind) = fixture();
        let cont_path = dir.path().join(ROOT_SUBDIR).join("etc/passwd");
        let before = fs::read(&cont_path).unwrap();

        bind.start(&["/etc/passwd".to_owned()]).unwrap();
        assert!(cont_path.is_symlink());
        bind.restore();

        let meta = fs::symlink_metadata(&cont_path).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read(&cont_path).unwrap(), before);
        assert!(!dir.path().join(ORIG_DIR).exists());
    }

    #[test]
    fn restore_without_start_is_noop() {
        let (_dir, mut bind) = fixture();
        bind.restore();
    }

    #[test]
    fn start_skips_missing_and_non_regular() {
        let (dir, mut bind) = fixture();
        fs::create_dir_all(dir.path().join(ROOT_SUBDIR).join("somedir")).unwrap();
        let (_holding, _) = bind
            .start(&["/nonexistent".to_owned(), "/somedir".to_owned()])
            .unwrap();
        assert!(bind.orig_file("/nonexistent").is_none());
        assert!(bind.orig_file("/somedir").is_none());
        bind.restore();
    }

    #[test]
    fn second_start_does_not_restash() {
        let (_dir, mut bind) = fixture();
        bind.start(&["/etc/passwd".to_owned()]).unwrap();
        let orig = bind.orig_file("/etc/passwd").unwrap();
        let before = fs::read(&orig).unwrap();
        // second start sees a symlink at the container path and keeps the stash
        bind.start(&["/etc/passwd".to_owned()]).unwrap();
        assert_eq!(fs::read(&orig).unwrap(), before);
        bind.restore();
    }

    #[test]
    fn second_start_drops_previous_holding_dir() {
        let (_dir, mut bind) = fixture();
        let (first, _) = bind.start(&["/etc/passwd".to_owned()]).unwrap();
        let (second, _) = bind.start(&["/etc/passwd".to_owned()]).unwrap();
        assert_ne!(first, second);
        assert!(!first.exists());
        assert!(second.join("etc#passwd").is_file());
        bind.restore();
    }

    #[test]
    fn add_requires_started_bind() {
        let (_dir, bind) = fixture();
        let err = bind.add(Path::new("/etc/hostname"), "/etc/hostname");
        assert!(err.is_err());
    }
}
