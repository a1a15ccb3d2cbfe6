use crate::EngineError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Convert the rootfs symlink layout between the direct form (absolute
/// targets relative to the container's `/`) and the indirect form expected
/// by loader injection (targets prefixed with the host path of ROOT, so
/// they resolve without a chroot).
///
/// `orig_root` is the ROOT real path recorded when the mode was last
/// committed; it is stripped as well so containers moved on disk still
/// convert back cleanly. With `force`, per-entry failures are logged and
/// skipped instead of aborting.
pub fn links_conv(
    root: &Path,
    orig_root: Option<&Path>,
    to_indirect: bool,
    force: bool,
) -> Result<(), EngineError> {
    let mut prefixes: Vec<PathBuf> = vec![root.to_path_buf()];
    if let Some(orig) = orig_root {
        if orig != root {
            prefixes.push(orig.to_path_buf());
        }
    }
    walk(root, root, &prefixes, to_indirect, force)
}

fn walk(
    root: &Path,
    dir: &Path,
    prefixes: &[PathBuf],
    to_indirect: bool,
    force: bool,
) -> Result<(), EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if force => {
            warn!("links: cannot read {}: {e}", dir.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(root, &path, prefixes, to_indirect, force)?;
        } else if file_type.is_symlink() {
            if let Err(e) = convert_one(root, &path, prefixes, to_indirect) {
                if force {
                    warn!("links: skipping {}: {e}", path.display());
                } else {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn convert_one(
    root: &Path,
    link: &Path,
    prefixes: &[PathBuf],
    to_indirect: bool,
) -> Result<(), EngineError> {
    let target = fs::read_link(link)?;
    if !target.is_absolute() {
        return Ok(()); // relative links are layout-independent
    }

    let new_target = if to_indirect {
        if prefixes.iter().any(|p| target.starts_with(p)) {
            return Ok(()); // already indirect
        }
        root.join(target.strip_prefix("/").unwrap_or(&target))
    } else {
        let Some(prefix) = prefixes.iter().find(|p| target.starts_with(p)) else {
            return Ok(()); // already direct
        };
        match target.strip_prefix(prefix) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("/"),
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => return Ok(()),
        }
    };

    fs::remove_file(link)?;
    std::os::unix::fs::symlink(&new_target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_target(link: &Path) -> PathBuf {
        fs::read_link(link).unwrap()
    }

    #[test]
    fn direct_to_indirect_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("run")).unwrap();
        std::os::unix::fs::symlink("/run/real", root.join("etc/link")).unwrap();
        std::os::unix::fs::symlink("rel/target", root.join("etc/rel")).unwrap();

        links_conv(&root, None, true, false).unwrap();
        assert_eq!(read_target(&root.join("etc/link")), root.join("run/real"));
        // relative links untouched
        assert_eq!(read_target(&root.join("etc/rel")), PathBuf::from("rel/target"));

        links_conv(&root, None, false, false).unwrap();
        assert_eq!(read_target(&root.join("etc/link")), PathBuf::from("/run/real"));
    }

    #[test]
    fn indirect_conversion_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink("/run/real", root.join("etc/link")).unwrap();

        links_conv(&root, None, true, false).unwrap();
        let once = read_target(&root.join("etc/link"));
        links_conv(&root, None, true, false).unwrap();
        assert_eq!(read_target(&root.join("etc/link")), once);
    }

    #[test]
    fn moved_container_restores_via_orig_root() {
        let dir = tempfile::tempdir().unwrap();
        let old_root = dir.path().join("OLD");
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("etc")).unwrap();
        // link converted while the container lived at OLD, then moved
        std::os::unix::fs::symlink(old_root.join("run/real"), root.join("etc/link")).unwrap();

        links_conv(&root, Some(&old_root), false, false).unwrap();
        assert_eq!(read_target(&root.join("etc/link")), PathBuf::from("/run/real"));
    }

    #[test]
    fn host_rooted_links_stay_direct_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink("/usr/share/zoneinfo/UTC", root.join("etc/localtime")).unwrap();

        links_conv(&root, None, false, false).unwrap();
        assert_eq!(
            read_target(&root.join("etc/localtime")),
            PathBuf::from("/usr/share/zoneinfo/UTC")
        );
    }
}
