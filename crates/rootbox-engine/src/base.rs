use crate::config::Config;
use crate::hostinfo::HostInfo;
use crate::identity::IdentityResolver;
use crate::pathtrans::{clean_path, PathTranslator};
use crate::EngineError;
use rootbox_store::{layout::ROOT_SUBDIR, LocalRepository, StrOrList};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Everything one `run` invocation needs, with named typed fields.
///
/// Constructed from CLI flags, merged with image metadata (CLI wins),
/// mutated through the validation steps of [`ExecutionEngineCommon::
/// run_init`], then consumed by engine-specific command assembly.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Environment pairs; image-declared entries are prepended during the
    /// metadata merge so user-specified values win.
    pub env: Vec<(String, String)>,
    /// Ordered `(host, container)` volume bindings.
    pub vol: Vec<(String, String)>,
    /// Volume exclusions matched against host side, container side, or
    /// the whole `host:container` spec.
    pub novol: Vec<String>,
    /// Requested user: `uid:gid` or a username; empty means root.
    pub user: String,
    pub cwd: String,
    pub entrypoint: Option<StrOrList>,
    pub cmd: Vec<String>,
    pub hostname: String,
    pub domainname: String,
    /// Exposed ports, `<port>[/proto]`.
    pub portsexp: Vec<String>,
    /// Port mappings `(host, container)`.
    pub portsmap: Vec<(u32, u32)>,
    pub devices: Vec<String>,

    pub nometa: bool,
    pub nosysdirs: bool,
    pub hostauth: bool,
    pub bindhome: bool,
    pub nodri: bool,
    pub netcoop: bool,
    pub nvidia: bool,
    /// Regenerate the OCI spec even if one exists (runc only).
    pub fresh_spec: bool,
    pub tty: bool,
    pub kernel: Option<String>,
    pub cpuset: Option<String>,

    // Resolved during identity setup.
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home: String,
    pub shell: String,
    pub gecos: String,
}

/// Shared setup pipeline embedded by value in every concrete engine.
///
/// [`run_init`](Self::run_init) turns a container id plus [`RunOptions`]
/// into a validated model and a resolved in-container executable path;
/// each step aborts the whole run with a distinct failure.
pub struct ExecutionEngineCommon {
    pub config: Config,
    pub host: HostInfo,
    pub repo: LocalRepository,
    pub opts: RunOptions,
    pub container_id: String,
    pub container_dir: PathBuf,
    pub root: PathBuf,
    /// Container-absolute path of the resolved executable.
    pub exec_path: String,
}

impl ExecutionEngineCommon {
    pub fn new(config: &Config, opts: RunOptions) -> Self {
        Self::with_host(config, opts, HostInfo::detect())
    }

    /// Constructor with an injected host identity, for tests.
    pub fn with_host(config: &Config, opts: RunOptions, host: HostInfo) -> Self {
        Self {
            repo: LocalRepository::new(&config.topdir),
            config: config.clone(),
            host,
            opts,
            container_id: String::new(),
            container_dir: PathBuf::new(),
            root: PathBuf::new(),
            exec_path: String::new(),
        }
    }

    /// Path translator over the current volume bindings.
    pub fn translator(&self) -> PathTranslator {
        PathTranslator::new(&self.root, &self.opts.vol)
    }

    /// Run the full setup pipeline and return the resolved in-container
    /// executable path.
    pub fn run_init(&mut self, container_id: &str) -> Result<String, EngineError> {
        self.container_id = container_id.to_owned();
        self.container_dir = self.repo.container_dir(container_id)?;
        self.root = self.container_dir.join(ROOT_SUBDIR);

        if !self.opts.nometa {
            self.merge_metadata()?;
        }
        self.check_exposed_ports()?;
        self.setup_identity()?;
        self.setup_volumes()?;
        self.check_cwd()?;
        let exec_path = self.resolve_executable()?;
        self.exec_path.clone_from(&exec_path);
        Ok(exec_path)
    }

    /// Merge image metadata into the options; CLI-provided values win and
    /// image env entries are prepended so user overrides come later.
    fn merge_metadata(&mut self) -> Result<(), EngineError> {
        let Some(meta) = self.repo.load_metadata(&self.container_id)? else {
            return Ok(());
        };
        let Some(image) = meta.effective_config() else {
            return Ok(());
        };

        if self.opts.user.is_empty() {
            if let Some(user) = &image.user {
                self.opts.user.clone_from(user);
            }
        }
        if self.opts.cwd.is_empty() {
            if let Some(cwd) = &image.working_dir {
                self.opts.cwd.clone_from(cwd);
            }
        }
        if self.opts.hostname.is_empty() {
            if let Some(hostname) = &image.hostname {
                self.opts.hostname.clone_from(hostname);
            }
        }
        if self.opts.domainname.is_empty() {
            if let Some(domainname) = &image.domainname {
                self.opts.domainname.clone_from(domainname);
            }
        }
        if self.opts.cmd.is_empty() {
            if let Some(cmd) = &image.cmd {
                self.opts.cmd = cmd.to_vec();
            }
        }
        if self.opts.entrypoint.is_none() {
            self.opts.entrypoint = image.entrypoint.clone();
        }
        for vol in image.volume_paths() {
            let vol = clean_path(&vol);
            if !self.opts.vol.iter().any(|(_, c)| *c == vol) {
                self.opts.vol.push((vol.clone(), vol));
            }
        }
        for port in image.exposed_port_specs() {
            if !self.opts.portsexp.contains(&port) {
                self.opts.portsexp.push(port);
            }
        }
        if let Some(env) = &image.env {
            let mut merged: Vec<(String, String)> = env
                .iter()
                .filter_map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                })
                .collect();
            merged.append(&mut self.opts.env);
            self.opts.env = merged;
        }
        Ok(())
    }

    /// Ports below 1024 need the invoking host identity to be root unless
    /// remapped to an unprivileged host port.
    fn check_exposed_ports(&self) -> Result<(), EngineError> {
        let mut privileged = Vec::new();
        for spec in &self.opts.portsexp {
            let port_str = spec.split('/').next().unwrap_or(spec);
            let Ok(port) = port_str.parse::<u32>() else {
                return Err(EngineError::InvalidEnvironment(format!(
                    "invalid exposed port '{spec}'"
                )));
            };
            if port >= 1024 {
                continue;
            }
            let remapped = self
                .opts
                .portsmap
                .iter()
                .any(|(host, container)| *container == port && *host >= 1024);
            if !remapped {
                privileged.push(port);
            }
        }
        if privileged.is_empty() {
            return Ok(());
        }
        if self.host.is_root() {
            warn!("exposing privileged ports {privileged:?} as root");
            return Ok(());
        }
        Err(EngineError::InvalidEnvironment(format!(
            "this container exposes privileged ports {privileged:?}, requires root or remapping"
        )))
    }

    /// Resolve the requested user and record any synthesized passwd/group
    /// fragments as additional host-auth bindings.
    fn setup_identity(&mut self) -> Result<(), EngineError> {
        let host_auth = self.opts.hostauth
            || self
                .opts
                .vol
                .iter()
                .any(|(_, container)| container == "/etc/passwd");
        let resolver =
            IdentityResolver::new(&self.container_dir, &self.host, &self.config.tmpdir);
        let resolved = resolver.resolve(&self.opts.user, host_auth)?;

        self.opts.uid = resolved.identity.uid;
        self.opts.gid = resolved.identity.gid;
        self.opts.username = resolved.identity.user;
        self.opts.home = resolved.identity.home;
        self.opts.shell = resolved.identity.shell;
        self.opts.gecos = resolved.identity.gecos;
        self.opts.vol.extend(resolved.extra_bindings);
        Ok(())
    }

    /// Host home directory of the invoking user for `--bindhome`.
    fn host_home(&self) -> Option<String> {
        std::env::var("HOME").ok().filter(|h| h.starts_with('/'))
    }

    fn setup_volumes(&mut self) -> Result<(), EngineError> {
        // Defaults first; a known default that is absent on the host is
        // dropped with a warning instead of failing the run.
        let mut known_virtual: Vec<String> = Vec::new();
        if !self.opts.nosysdirs {
            for dir in self.config.sysdirs.clone() {
                self.push_default_volume(&dir);
                known_virtual.push(dir);
            }
        }
        if self.opts.hostauth {
            for file in self.config.hostauth_files.clone() {
                self.push_default_volume(&file);
                known_virtual.push(file);
            }
        }
        if !self.opts.nodri {
            for dir in self.config.dri_dirs.clone() {
                self.push_default_volume(&dir);
                known_virtual.push(dir);
            }
        }
        if self.opts.bindhome {
            if let Some(home) = self.host_home() {
                self.push_default_volume(&home);
            }
        }

        // Exclusions: host side, container side, or the whole spec.
        let novol = self.opts.novol.clone();
        self.opts.vol.retain(|(host, container)| {
            let spec = format!("{host}:{container}");
            let excluded = novol
                .iter()
                .any(|pat| pat == host || pat == container || *pat == spec);
            if excluded {
                debug!("excluding volume {spec}");
            }
            !excluded
        });

        // Validation.
        let mut kept = Vec::with_capacity(self.opts.vol.len());
        for (host, container) in std::mem::take(&mut self.opts.vol) {
            if !host.starts_with('/') || !container.starts_with('/') {
                return Err(EngineError::InvalidEnvironment(format!(
                    "volume paths must be absolute: {host}:{container}"
                )));
            }
            if !Path::new(&host).exists() {
                if known_virtual.contains(&host) {
                    warn!("default volume {host} not present on host, dropping");
                    continue;
                }
                return Err(EngineError::InvalidEnvironment(format!(
                    "volume host path does not exist: {host}"
                )));
            }
            kept.push((host, container));
        }
        self.opts.vol = kept;

        // Create placeholder mount points matching the host side's type.
        for (host, container) in self.opts.vol.clone() {
            self.create_mountpoint(&host, &container)?;
        }
        Ok(())
    }

    fn push_default_volume(&mut self, path: &str) {
        let path = clean_path(path);
        if !self
            .opts
            .vol
            .iter()
            .any(|(_, container)| *container == path)
        {
            self.opts.vol.push((path.clone(), path));
        }
    }

    fn create_mountpoint(&self, host: &str, container: &str) -> Result<(), EngineError> {
        let point = self.root.join(container.trim_start_matches('/'));
        if point.exists() || point.is_symlink() {
            return Ok(());
        }
        if Path::new(host).is_dir() {
            fs::create_dir_all(&point)?;
        } else {
            if let Some(parent) = point.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&point, b"")?;
        }
        Ok(())
    }

    /// Default the working directory to the resolved home and require it
    /// to exist as a directory inside the container view.
    fn check_cwd(&mut self) -> Result<(), EngineError> {
        if self.opts.cwd.is_empty() {
            self.opts.cwd.clone_from(&self.opts.home);
        }
        self.opts.cwd = clean_path(&self.opts.cwd);
        let host_cwd = self.translator().cont2host(&self.opts.cwd);
        if host_cwd.is_empty() || !Path::new(&host_cwd).is_dir() {
            return Err(EngineError::InvalidEnvironment(format!(
                "invalid working directory: {}",
                self.opts.cwd
            )));
        }
        Ok(())
    }

    /// Combine entrypoint and cmd per container semantics and resolve
    /// argv[0] to an absolute in-container path.
    fn resolve_executable(&mut self) -> Result<String, EngineError> {
        let mut argv: Vec<String> = match &self.opts.entrypoint {
            // A string entrypoint replaces cmd entirely.
            Some(StrOrList::Str(s)) => s.split_whitespace().map(str::to_owned).collect(),
            // A list entrypoint is prepended to any existing cmd.
            Some(StrOrList::List(l)) => {
                let mut v = l.clone();
                v.extend(self.opts.cmd.iter().cloned());
                v
            }
            None => self.opts.cmd.clone(),
        };
        if argv.is_empty() || argv[0].is_empty() {
            warn!(
                "no command specified, using default {:?}",
                self.config.default_cmd
            );
            argv = self.config.default_cmd.clone();
        }

        let prog = argv[0].clone();
        let exec_path = if prog.starts_with('/') {
            clean_path(&prog)
        } else if prog.starts_with("./") || prog.starts_with("../") {
            clean_path(&format!("{}/{prog}", self.opts.cwd))
        } else {
            self.search_container_path(&prog).ok_or_else(|| {
                EngineError::Setup(format!("command not found: {prog}"))
            })?
        };

        let host_path = self.translator().cont2host(&exec_path);
        if !is_executable(Path::new(&host_path)) {
            return Err(EngineError::Setup(format!("command not found: {prog}")));
        }

        argv[0].clone_from(&exec_path);
        self.opts.cmd = argv;
        Ok(exec_path)
    }

    /// Search the container's `$PATH` for `prog`.
    fn search_container_path(&self, prog: &str) -> Option<String> {
        let path_value = self
            .opts
            .env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map_or_else(
                || "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_owned(),
                |(_, v)| v.clone(),
            );
        let translator = self.translator();
        for dir in path_value.split(':').filter(|d| d.starts_with('/')) {
            let candidate = clean_path(&format!("{dir}/{prog}"));
            let host_path = translator.cont2host(&candidate);
            if is_executable(Path::new(&host_path)) {
                return Some(candidate);
            }
        }
        None
    }

    /// Child environment as an explicit map; the parent process
    /// environment is never mutated.
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for key in &self.config.valid_host_env {
            if self.config.invalid_host_env.contains(key) {
                continue;
            }
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }

        env.insert("HOME".to_owned(), self.opts.home.clone());
        env.insert("USER".to_owned(), self.opts.username.clone());
        env.insert("LOGNAME".to_owned(), self.opts.username.clone());
        env.insert("SHELL".to_owned(), self.opts.shell.clone());
        env.insert("SHLVL".to_owned(), "0".to_owned());
        let hostname = if self.opts.hostname.is_empty() {
            let id = &self.container_id;
            id[..12.min(id.len())].to_owned()
        } else {
            self.opts.hostname.clone()
        };
        env.insert("HOSTNAME".to_owned(), hostname);

        // Image env first, user overrides later: later inserts win.
        for (key, value) in &self.opts.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_host(uid: u32) -> HostInfo {
        HostInfo {
            uid,
            gid: uid,
            username: "tester".to_owned(),
            arch: "x86_64".to_owned(),
            kernel: "5.15.0".to_owned(),
        }
    }

    /// Container skeleton with a shell, passwd/group, and a home dir.
    fn fixture(config: &Config) -> (LocalRepository, String) {
        let repo = LocalRepository::new(&config.topdir);
        let id = "testc";
        let cdir = repo.create_container(id).unwrap();
        let root = cdir.join(ROOT_SUBDIR);
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("root")).unwrap();
        fs::write(root.join("bin/sh"), "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(root.join("bin/sh")).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(root.join("bin/sh"), perms).unwrap();
        fs::write(
            root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\n",
        )
        .unwrap();
        fs::write(root.join("etc/group"), "root:x:0:\n").unwrap();
        (repo, id.to_owned())
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            topdir: dir.to_path_buf(),
            tmpdir: dir.join("tmp"),
            ..Config::default()
        }
    }

    fn hermetic_opts() -> RunOptions {
        RunOptions {
            nosysdirs: true,
            nodri: true,
            ..RunOptions::default()
        }
    }

    #[test]
    fn run_init_resolves_cmd_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (repo, id) = fixture(&config);

        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(
            repo.container_dir(&id).unwrap().join("container.json"),
            r#"{"config": {"Cmd": ["/bin/sh"]}}"#,
        )
        .unwrap();

        let mut opts = hermetic_opts();
        opts.vol
            .push((data.to_string_lossy().into_owned(), "/mnt".to_owned()));
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        let exec_path = common.run_init(&id).unwrap();

        assert_eq!(exec_path, "/bin/sh");
        assert!(common
            .opts
            .vol
            .contains(&(data.to_string_lossy().into_owned(), "/mnt".to_owned())));
        // mount point created in the container tree
        assert!(common.root.join("mnt").is_dir());
        assert_eq!(common.opts.cmd, vec!["/bin/sh"]);
    }

    #[test]
    fn cli_values_win_over_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (repo, id) = fixture(&config);
        fs::write(
            repo.container_dir(&id).unwrap().join("container.json"),
            r#"{"config": {"WorkingDir": "/srv", "Cmd": ["/bin/false"],
                "Env": ["LANG=C", "FOO=image"]}}"#,
        )
        .unwrap();

        let mut opts = hermetic_opts();
        opts.cwd = "/root".to_owned();
        opts.cmd = vec!["/bin/sh".to_owned()];
        opts.env.push(("FOO".to_owned(), "cli".to_owned()));
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();

        assert_eq!(common.opts.cwd, "/root");
        assert_eq!(common.opts.cmd, vec!["/bin/sh"]);
        // image env prepended, CLI override later
        let env = common.build_env();
        assert_eq!(env.get("FOO").map(String::as_str), Some("cli"));
        assert_eq!(env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn string_entrypoint_replaces_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.entrypoint = Some(StrOrList::Str("/bin/sh -c".to_owned()));
        opts.cmd = vec!["/bin/ignored".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();
        assert_eq!(common.opts.cmd, vec!["/bin/sh", "-c"]);
    }

    #[test]
    fn list_entrypoint_prepends_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.entrypoint = Some(StrOrList::List(vec!["/bin/sh".to_owned()]));
        opts.cmd = vec!["-c".to_owned(), "ls".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();
        assert_eq!(common.opts.cmd, vec!["/bin/sh", "-c", "ls"]);
    }

    #[test]
    fn privileged_port_requires_root_or_remap() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        opts.portsexp = vec!["80/tcp".to_owned()];
        let mut common =
            ExecutionEngineCommon::with_host(&config, opts.clone(), test_host(1000));
        assert!(matches!(
            common.run_init(&id),
            Err(EngineError::InvalidEnvironment(_))
        ));

        // remapped to an unprivileged host port: warn only
        opts.portsmap = vec![(8080, 80)];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        assert!(common.run_init(&id).is_ok());
    }

    #[test]
    fn missing_host_volume_fails_unless_known_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        opts.vol
            .push(("/no/such/host/dir".to_owned(), "/mnt".to_owned()));
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        assert!(matches!(
            common.run_init(&id),
            Err(EngineError::InvalidEnvironment(_))
        ));
    }

    #[test]
    fn novol_excludes_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let host = data.to_string_lossy().into_owned();

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        opts.vol.push((host.clone(), "/mnt".to_owned()));
        opts.novol = vec!["/mnt".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();
        assert!(!common.opts.vol.iter().any(|(h, _)| *h == host));
    }

    #[test]
    fn cwd_defaults_to_home_and_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();
        assert_eq!(common.opts.cwd, "/root");

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        opts.cwd = "/no/such/dir".to_owned();
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        assert!(matches!(
            common.run_init(&id),
            Err(EngineError::InvalidEnvironment(_))
        ));
    }

    #[test]
    fn path_search_finds_relative_command() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["sh".to_owned()];
        opts.env
            .push(("PATH".to_owned(), "/usr/bin:/bin".to_owned()));
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        let exec_path = common.run_init(&id).unwrap();
        assert_eq!(exec_path, "/bin/sh");
    }

    #[test]
    fn unresolvable_command_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/absent".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        let err = common.run_init(&id).unwrap_err();
        assert!(err.to_string().contains("command not found"));
    }

    #[test]
    fn build_env_sets_identity_vars() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::create_dir_all(&config.tmpdir).unwrap();
        let (_repo, id) = fixture(&config);

        let mut opts = hermetic_opts();
        opts.cmd = vec!["/bin/sh".to_owned()];
        let mut common = ExecutionEngineCommon::with_host(&config, opts, test_host(1000));
        common.run_init(&id).unwrap();
        let env = common.build_env();
        assert_eq!(env.get("HOME").map(String::as_str), Some("/root"));
        assert_eq!(env.get("USER").map(String::as_str), Some("root"));
        assert_eq!(env.get("SHLVL").map(String::as_str), Some("0"));
        assert_eq!(env.get("HOSTNAME").map(String::as_str), Some("testc"));
    }
}
