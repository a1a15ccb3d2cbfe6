use crate::filebind::FileBind;
use crate::hostinfo::HostInfo;
use crate::EngineError;
use rootbox_store::layout::ROOT_SUBDIR;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Gecos marker stamped on synthesized users.
const SYNTH_GECOS: &str = "*ROOTBOX*";

/// A fully resolved identity record (one passwd line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

/// Outcome of identity resolution.
#[derive(Debug)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    /// Extra `(host, container)` bindings carrying synthesized passwd and
    /// group fragments into the container.
    pub extra_bindings: Vec<(String, String)>,
    pub synthesized: bool,
}

/// Parse one passwd line (`user:x:uid:gid:gecos:home:shell`).
fn parse_passwd_line(line: &str) -> Option<Identity> {
    let fields: Vec<&str> = line.splitn(7, ':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(Identity {
        user: fields[0].to_owned(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        gecos: fields[4].to_owned(),
        home: fields[5].to_owned(),
        shell: fields[6].to_owned(),
    })
}

fn lookup_by_name(passwd: &Path, name: &str) -> Option<Identity> {
    let content = fs::read_to_string(passwd).ok()?;
    content
        .lines()
        .filter_map(parse_passwd_line)
        .find(|id| id.user == name)
}

fn lookup_by_uid(passwd: &Path, uid: u32) -> Option<Identity> {
    let content = fs::read_to_string(passwd).ok()?;
    content
        .lines()
        .filter_map(parse_passwd_line)
        .find(|id| id.uid == uid)
}

/// Resolves a requested user spec against the host's or the container's
/// passwd/group database, synthesizing a user when necessary.
pub struct IdentityResolver<'a> {
    container_dir: PathBuf,
    host: &'a HostInfo,
    tmpdir: PathBuf,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(container_dir: impl Into<PathBuf>, host: &'a HostInfo, tmpdir: &Path) -> Self {
        Self {
            container_dir: container_dir.into(),
            host,
            tmpdir: tmpdir.to_path_buf(),
        }
    }

    /// Pick the passwd or group database file to consult.
    ///
    /// Host databases are used when host authentication is in effect.
    /// Otherwise the container's own copy is used; if that copy is a
    /// dangling symlink left behind by an active FileBind redirection, the
    /// stashed original is consulted instead.
    fn auth_file(&self, base: &str, host_auth: bool) -> PathBuf {
        if host_auth {
            return PathBuf::from("/etc").join(base);
        }
        let cont = self
            .container_dir
            .join(ROOT_SUBDIR)
            .join("etc")
            .join(base);
        if cont.is_symlink() && !cont.exists() {
            let bind = FileBind::new(&self.container_dir);
            if let Some(orig) = bind.orig_file(&format!("/etc/{base}")) {
                debug!("using stashed {} from {}", base, orig.display());
                return orig;
            }
        }
        cont
    }

    /// Resolve `spec` (either `uid:gid` or a username).
    ///
    /// With `host_auth` the host database is authoritative and an unknown
    /// identity is a hard error. Without it, unknown identities are
    /// synthesized into temporary passwd/group copies returned as extra
    /// bindings over `/etc/passwd` and `/etc/group`.
    pub fn resolve(&self, spec: &str, host_auth: bool) -> Result<ResolvedIdentity, EngineError> {
        let passwd = self.auth_file("passwd", host_auth);
        let spec = if spec.is_empty() { "root" } else { spec };

        let (found, want_uid, want_gid) = if let Some((uid_s, gid_s)) = spec.split_once(':') {
            let uid: u32 = uid_s
                .parse()
                .map_err(|_| EngineError::Setup(format!("invalid user spec '{spec}'")))?;
            let gid: u32 = gid_s
                .parse()
                .map_err(|_| EngineError::Setup(format!("invalid user spec '{spec}'")))?;
            (lookup_by_uid(&passwd, uid), Some(uid), Some(gid))
        } else {
            (lookup_by_name(&passwd, spec), None, None)
        };

        if let Some(mut identity) = found {
            if let Some(gid) = want_gid {
                identity.gid = gid;
            }
            return Ok(ResolvedIdentity {
                identity,
                extra_bindings: Vec::new(),
                synthesized: false,
            });
        }

        if host_auth {
            return Err(EngineError::Setup(format!(
                "user '{spec}' not found in host authentication files"
            )));
        }

        // Synthesize a new container user.
        let uid = want_uid.unwrap_or(self.host.uid);
        let gid = want_gid.unwrap_or(self.host.gid);
        let user = if spec.contains(':') {
            format!("rbox{uid}")
        } else {
            spec.to_owned()
        };
        let home = if uid == 0 {
            "/root".to_owned()
        } else {
            format!("/home/{user}")
        };
        let identity = Identity {
            user: user.clone(),
            uid,
            gid,
            gecos: SYNTH_GECOS.to_owned(),
            home,
            shell: "/bin/sh".to_owned(),
        };
        warn!("user '{spec}' not found, synthesizing '{user}' ({uid}:{gid})");

        let group = self.auth_file("group", host_auth);
        let tmp_passwd = self.write_fragment(&passwd, &passwd_line(&identity))?;
        let tmp_group = self.write_fragment(&group, &format!("{user}:x:{gid}:\n"))?;

        Ok(ResolvedIdentity {
            identity,
            extra_bindings: vec![
                (tmp_passwd, "/etc/passwd".to_owned()),
                (tmp_group, "/etc/group".to_owned()),
            ],
            synthesized: true,
        })
    }

    /// Copy `source` into a kept temp file and append `line`.
    fn write_fragment(&self, source: &Path, line: &str) -> Result<String, EngineError> {
        let mut file = tempfile::Builder::new()
            .prefix("rootbox-auth-")
            .tempfile_in(&self.tmpdir)?;
        let mut content = fs::read_to_string(source).unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        file.write_all(content.as_bytes())?;
        file.write_all(line.as_bytes())?;
        let (_, path) = file.keep().map_err(|e| EngineError::Io(e.error))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

fn passwd_line(id: &Identity) -> String {
    format!(
        "{}:x:{}:{}:{}:{}:{}\n",
        id.user, id.uid, id.gid, id.gecos, id.home, id.shell
    )
}
