use crate::metadata::ContainerMetadata;
use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the rootfs subtree inside a container directory.
pub const ROOT_SUBDIR: &str = "ROOT";
/// Name of the image metadata JSON inside a container directory.
pub const METADATA_FILE: &str = "container.json";

/// Directory layout of the local container repository.
///
/// Layout under the top directory:
///
/// ```text
/// containers/<id>/ROOT/...        unpacked rootfs
/// containers/<id>/container.json  image metadata
/// containers/<name> -> <id>       name alias (symlink)
/// ```
#[derive(Debug, Clone)]
pub struct LocalRepository {
    topdir: PathBuf,
}

impl LocalRepository {
    pub fn new(topdir: impl Into<PathBuf>) -> Self {
        Self {
            topdir: topdir.into(),
        }
    }

    #[inline]
    pub fn topdir(&self) -> &Path {
        &self.topdir
    }

    #[inline]
    pub fn containers_dir(&self) -> PathBuf {
        self.topdir.join("containers")
    }

    /// Path of a container directory without checking it exists.
    #[inline]
    pub fn container_path(&self, container_id: &str) -> PathBuf {
        self.containers_dir().join(container_id)
    }

    /// Resolve a container id or name alias to its directory.
    pub fn container_dir(&self, container_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.container_path(container_id);
        if dir.is_dir() {
            return Ok(dir);
        }
        // Name aliases are symlinks in the containers directory.
        if dir.is_symlink() {
            let target = fs::read_link(&dir)?;
            let resolved = if target.is_absolute() {
                target
            } else {
                self.containers_dir().join(target)
            };
            if resolved.is_dir() {
                return Ok(resolved);
            }
            warn!("name alias '{container_id}' points at a missing container");
        }
        Err(StoreError::ContainerNotFound(container_id.to_owned()))
    }

    /// The unpacked rootfs directory of a container.
    pub fn root_dir(&self, container_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.container_dir(container_id)?.join(ROOT_SUBDIR))
    }

    /// All name aliases pointing at the given container id.
    pub fn get_container_name(&self, container_id: &str) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(entries) = fs::read_dir(self.containers_dir()) else {
            return names;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_symlink() {
                continue;
            }
            if let Ok(target) = fs::read_link(&path) {
                if target.file_name().is_some_and(|t| t == container_id)
                    || target == Path::new(container_id)
                {
                    if let Some(name) = path.file_name() {
                        names.push(name.to_string_lossy().into_owned());
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Create a name alias for a container. Fails if the name is taken.
    pub fn set_container_name(&self, container_id: &str, name: &str) -> Result<(), StoreError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(StoreError::BadName(name.to_owned()));
        }
        self.container_dir(container_id)?;
        let link = self.containers_dir().join(name);
        if link.exists() || link.is_symlink() {
            return Err(StoreError::BadName(name.to_owned()));
        }
        std::os::unix::fs::symlink(container_id, &link)?;
        Ok(())
    }

    /// List the ids of all containers in the repository.
    pub fn list_containers(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let Ok(entries) = fs::read_dir(self.containers_dir()) else {
            return ids;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                if let Some(id) = path.file_name() {
                    ids.push(id.to_string_lossy().into_owned());
                }
            }
        }
        ids.sort();
        ids
    }

    /// Load and parse the image metadata JSON for a container.
    ///
    /// A missing metadata file is not an error: containers imported from a
    /// plain tarball have none.
    pub fn load_metadata(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerMetadata>, StoreError> {
        let path = self.container_dir(container_id)?.join(METADATA_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let meta: ContainerMetadata = serde_json::from_str(&content)?;
        Ok(Some(meta))
    }

    /// Create an empty container skeleton (directory + ROOT). Used by the
    /// import path and by tests.
    pub fn create_container(&self, container_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.container_path(container_id);
        fs::create_dir_all(dir.join(ROOT_SUBDIR))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let repo = LocalRepository::new("/tmp/rootbox-test");
        assert_eq!(
            repo.containers_dir(),
            PathBuf::from("/tmp/rootbox-test/containers")
        );
        assert_eq!(
            repo.container_path("abc123"),
            PathBuf::from("/tmp/rootbox-test/containers/abc123")
        );
    }

    #[test]
    fn missing_container_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        assert!(matches!(
            repo.container_dir("nope"),
            Err(StoreError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn create_and_resolve_container() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc123").unwrap();

        let resolved = repo.container_dir("abc123").unwrap();
        assert!(resolved.is_dir());
        assert!(repo.root_dir("abc123").unwrap().is_dir());
    }

    #[test]
    fn name_alias_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc123").unwrap();
        repo.set_container_name("abc123", "myapp").unwrap();

        assert_eq!(repo.get_container_name("abc123"), vec!["myapp"]);
        let via_name = repo.container_dir("myapp").unwrap();
        let via_id = repo.container_dir("abc123").unwrap();
        assert_eq!(via_name, via_id);
    }

    #[test]
    fn duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc").unwrap();
        repo.create_container("def").unwrap();
        repo.set_container_name("abc", "taken").unwrap();
        assert!(repo.set_container_name("def", "taken").is_err());
        assert!(repo.set_container_name("def", "with/slash").is_err());
    }

    #[test]
    fn dangling_alias_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc").unwrap();
        repo.set_container_name("abc", "ghost").unwrap();
        fs::remove_dir_all(repo.container_path("abc")).unwrap();

        assert!(matches!(
            repo.container_dir("ghost"),
            Err(StoreError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn list_containers_skips_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc").unwrap();
        repo.create_container("def").unwrap();
        repo.set_container_name("abc", "alias").unwrap();
        assert_eq!(repo.list_containers(), vec!["abc", "def"]);
    }

    #[test]
    fn metadata_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        repo.create_container("abc").unwrap();
        assert!(repo.load_metadata("abc").unwrap().is_none());
    }

    #[test]
    fn metadata_loads_config_section() {
        let dir = tempfile::tempdir().unwrap();
        let repo = LocalRepository::new(dir.path());
        let cdir = repo.create_container("abc").unwrap();
        fs::write(
            cdir.join(METADATA_FILE),
            r#"{"config": {"Cmd": ["/bin/sh"], "Env": ["PATH=/usr/bin"]}}"#,
        )
        .unwrap();

        let meta = repo.load_metadata("abc").unwrap().unwrap();
        let config = meta.effective_config().unwrap();
        assert_eq!(config.cmd.as_ref().unwrap().to_vec(), vec!["/bin/sh"]);
    }
}
