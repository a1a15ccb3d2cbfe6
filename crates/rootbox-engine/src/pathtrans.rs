use std::fs;
use std::path::{Path, PathBuf};

/// Collapse runs of `/` and strip one trailing `/` (root stays `/`).
/// Pure string operation, never touches the filesystem.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Split a `host[:container]` volume spec; the container side defaults to
/// the host side when absent or empty. Both sides are cleaned.
pub fn split_volume_spec(spec: &str) -> (String, String) {
    match spec.split_once(':') {
        Some((host, container)) if !container.is_empty() => {
            (clean_path(host), clean_path(container))
        }
        Some((host, _)) => {
            let host = clean_path(host);
            (host.clone(), host)
        }
        None => {
            let host = clean_path(spec);
            (host.clone(), host)
        }
    }
}

/// Maps container-absolute paths to host paths given a container root and
/// the active volume bindings.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
    bindings: Vec<(String, String)>,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>, bindings: &[(String, String)]) -> Self {
        Self {
            root: root.into(),
            bindings: bindings.to_vec(),
        }
    }

    /// Translate a container-absolute path to a host path.
    ///
    /// The first binding whose container side is a directory-prefix of the
    /// path wins; otherwise the container root is prefixed. The result is
    /// then walked component by component: absolute symlink targets found
    /// inside the container root are re-rooted under it unless they already
    /// point there, so container-internal links cannot escape to unrelated
    /// host locations. Non-absolute input returns the empty string.
    pub fn cont2host(&self, pathname: &str) -> String {
        if !pathname.starts_with('/') {
            return String::new();
        }
        let pathname = clean_path(pathname);

        let mut path = format!("{}{}", self.root.display(), pathname);
        for (host, container) in &self.bindings {
            if let Some(rest) = strip_dir_prefix(&pathname, container) {
                path = format!("{host}{rest}");
                break;
            }
        }

        self.follow_symlinks(&path)
    }

    /// Walk `path` component-wise resolving symlinks with confinement.
    fn follow_symlinks(&self, path: &str) -> String {
        let root = self.root.display().to_string();
        let mut resolved = String::new();
        // Bounded to defend against symlink cycles.
        let mut budget = 32;

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            resolved.push('/');
            resolved.push_str(comp);
            loop {
                let meta = fs::symlink_metadata(&resolved);
                let is_link = meta.map(|m| m.file_type().is_symlink()).unwrap_or(false);
                if !is_link || budget == 0 {
                    break;
                }
                budget -= 1;
                let Ok(target) = fs::read_link(&resolved) else {
                    break;
                };
                let target = target.to_string_lossy().into_owned();
                if target.starts_with('/') {
                    // Only re-root absolute targets while we are still
                    // inside the container tree; host-rooted bind targets
                    // resolve as-is.
                    if strip_dir_prefix(&resolved, &root).is_some()
                        && strip_dir_prefix(&target, &root).is_none()
                    {
                        resolved = format!("{root}{}", clean_path(&target));
                    } else {
                        resolved = clean_path(&target);
                    }
                } else {
                    let parent = match resolved.rfind('/') {
                        Some(0) | None => String::new(),
                        Some(idx) => resolved[..idx].to_owned(),
                    };
                    resolved = clean_path(&format!("{parent}/{target}"));
                }
            }
        }
        if resolved.is_empty() {
            resolved.push('/');
        }
        resolved
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// If `prefix` is `path` itself or a directory-ancestor of it, return the
/// remainder (starting with `/`, or empty on exact match).
fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_collapses_and_strips() {
        assert_eq!(clean_path("//bin//ls"), "/bin/ls");
        assert_eq!(clean_path("/usr/"), "/usr");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("///"), "/");
        assert_eq!(clean_path("a//b/"), "a/b");
    }

    #[test]
    fn clean_path_is_idempotent() {
        for p in ["//bin//ls", "/usr/", "/", "a//b/", "relative//x"] {
            assert_eq!(clean_path(&clean_path(p)), clean_path(p));
        }
    }

    #[test]
    fn split_volume_spec_round_trips() {
        assert_eq!(
            split_volume_spec("/data:/mnt"),
            ("/data".to_owned(), "/mnt".to_owned())
        );
        assert_eq!(
            split_volume_spec("/data"),
            ("/data".to_owned(), "/data".to_owned())
        );
        // empty container side defaults to host side
        assert_eq!(
            split_volume_spec("/data:"),
            ("/data".to_owned(), "/data".to_owned())
        );
        assert_eq!(
            split_volume_spec("//host//dir:/mnt//sub/"),
            ("/host/dir".to_owned(), "/mnt/sub".to_owned())
        );
    }

    #[test]
    fn cont2host_uses_matching_binding() {
        let dir = tempfile::tempdir().unwrap();
        let translator = PathTranslator::new(
            dir.path(),
            &[("/host/etc/passwd".to_owned(), "/etc/passwd".to_owned())],
        );
        assert_eq!(translator.cont2host("/etc/passwd"), "/host/etc/passwd");
    }

    #[test]
    fn cont2host_prefix_match_is_directory_wise() {
        let dir = tempfile::tempdir().unwrap();
        let translator =
            PathTranslator::new(dir.path(), &[("/host/data".to_owned(), "/data".to_owned())]);
        assert_eq!(translator.cont2host("/data/file"), "/host/data/file");
        // "/database" must not match the "/data" binding
        assert_eq!(
            translator.cont2host("/database"),
            format!("{}/database", dir.path().display())
        );
    }

    #[test]
    fn cont2host_falls_back_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let translator = PathTranslator::new(dir.path(), &[]);
        assert_eq!(
            translator.cont2host("/etc/passwd"),
            format!("{}/etc/passwd", dir.path().display())
        );
    }

    #[test]
    fn cont2host_rejects_relative_input() {
        let dir = tempfile::tempdir().unwrap();
        let translator = PathTranslator::new(dir.path(), &[]);
        assert_eq!(translator.cont2host("etc/passwd"), "");
    }

    #[test]
    fn absolute_symlink_inside_root_is_confined() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(root.join("run")).unwrap();
        std::fs::write(root.join("run/real.conf"), "x").unwrap();
        // container-internal absolute link: /etc/app.conf -> /run/real.conf
        std::os::unix::fs::symlink("/run/real.conf", root.join("etc/app.conf")).unwrap();

        let translator = PathTranslator::new(&root, &[]);
        assert_eq!(
            translator.cont2host("/etc/app.conf"),
            format!("{}/run/real.conf", root.display())
        );
    }

    #[test]
    fn relative_symlink_resolves_against_parent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ROOT");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/real"), "x").unwrap();
        std::os::unix::fs::symlink("real", root.join("etc/link")).unwrap();

        let translator = PathTranslator::new(&root, &[]);
        assert_eq!(
            translator.cont2host("/etc/link"),
            format!("{}/etc/real", root.display())
        );
    }
}
