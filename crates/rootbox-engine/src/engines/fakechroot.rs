use crate::base::{ExecutionEngineCommon, RunOptions};
use crate::config::Config;
use crate::elfpatch::{ElfPatcher, PatchElfTool};
use crate::engines::{child_code, ExecutionEngine};
use crate::hostinfo::guest_distribution;
use crate::EngineError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Engine running the container through `LD_PRELOAD` path interception
/// (modes F1 to F4).
///
/// F1 preloads the library and nothing else, so it only works when the
/// container's loader can run on the host as-is. F2 patches the loader,
/// F3 additionally patches every binary's interpreter reference, and F4
/// re-patches binaries added after the mode was committed.
pub struct FakechrootEngine {
    common: ExecutionEngineCommon,
    mode: String,
}

impl FakechrootEngine {
    pub fn new(config: &Config, opts: RunOptions, mode: &str) -> Self {
        Self {
            common: ExecutionEngineCommon::new(config, opts),
            mode: mode.to_owned(),
        }
    }

    fn uses_patched_loader(&self) -> bool {
        matches!(self.mode.as_str(), "F2" | "F3" | "F4")
    }

    /// Pick the preload library: configured override first, then builds
    /// matching the guest distribution, then the generic fallbacks.
    fn select_library(&self) -> Result<PathBuf, EngineError> {
        if let Some(so) = &self.common.config.fakechroot_so {
            let path = PathBuf::from(so);
            if path.is_file() {
                return Ok(path);
            }
            return Err(EngineError::MissingExecutable(format!(
                "configured fakechroot library not found: {so}"
            )));
        }
        let arch = &self.common.host.arch;
        let (distro, version) = guest_distribution(&self.common.root);
        let mut candidates = Vec::new();
        if !distro.is_empty() && !version.is_empty() {
            candidates.push(format!("libfakechroot-{distro}{version}-{arch}.so"));
        }
        if !distro.is_empty() {
            candidates.push(format!("libfakechroot-{distro}-{arch}.so"));
        }
        candidates.push(format!("libfakechroot-{arch}.so"));
        candidates.push("libfakechroot.so".to_owned());
        for name in candidates {
            let path = self.common.config.lib_dir.join(&name);
            if path.is_file() {
                debug!("using preload library {}", path.display());
                return Ok(path);
            }
        }
        Err(EngineError::MissingExecutable(
            "no usable libfakechroot build in the tool library".to_owned(),
        ))
    }

    fn patcher(&self) -> PatchElfTool {
        PatchElfTool::new(&self.common.container_dir, self.patchelf_path())
    }

    /// The FAKECHROOT_* block controlling path translation in the child.
    fn fakechroot_env(&self, library: &Path) -> Result<BTreeMap<String, String>, EngineError> {
        let mut env = BTreeMap::new();
        let real_root = fs::canonicalize(&self.common.root)
            .unwrap_or_else(|_| self.common.root.clone());
        env.insert(
            "FAKECHROOT_BASE".to_owned(),
            real_root.to_string_lossy().into_owned(),
        );
        env.insert(
            "FAKECHROOT_AF_UNIX_PATH".to_owned(),
            self.common.config.tmpdir.to_string_lossy().into_owned(),
        );
        env.insert(
            "LD_PRELOAD".to_owned(),
            library.to_string_lossy().into_owned(),
        );

        let vols = &self.common.opts.vol;
        if !vols.is_empty() {
            let exclude: Vec<&str> = vols.iter().map(|(_, c)| c.as_str()).collect();
            env.insert(
                "FAKECHROOT_EXCLUDE_PATH".to_owned(),
                exclude.join(":"),
            );
        }
        let dir_map: Vec<String> = vols
            .iter()
            .filter(|(host, container)| host != container)
            .map(|(host, container)| format!("{host}!{container}"))
            .collect();
        if !dir_map.is_empty() {
            env.insert("FAKECHROOT_DIR_MAP".to_owned(), dir_map.join(":"));
            env.insert("FAKECHROOT_EXPAND_SYMLINKS".to_owned(), "true".to_owned());
        } else {
            env.insert("FAKECHROOT_EXPAND_SYMLINKS".to_owned(), "false".to_owned());
        }

        // Some MPI stacks stat interconnect devices unconditionally;
        // whitelist the ones actually present on this host.
        let translator = self.common.translator();
        let filesok: Vec<&str> = self
            .common
            .config
            .access_files
            .iter()
            .filter(|c_path| Path::new(&translator.cont2host(c_path)).exists())
            .map(String::as_str)
            .collect();
        if !filesok.is_empty() {
            env.insert("FAKECHROOT_ACCESS_FILESOK".to_owned(), filesok.join(":"));
        }

        if self.uses_patched_loader() {
            let patcher = self.patcher();
            let loader = patcher.container_loader_path()?;
            let loader_host = format!("{}{loader}", real_root.to_string_lossy());
            env.insert("FAKECHROOT_ELFLOADER".to_owned(), loader_host.clone());
            env.insert("LD_LIBRARY_REAL".to_owned(), patcher.ld_library_path()?);
            if self.mode == "F4" {
                // Binaries installed after the mode switch are patched on
                // first exec by the preload library itself.
                env.insert(
                    "FAKECHROOT_PATCH_PATCHELF".to_owned(),
                    self.patchelf_path().to_string_lossy().into_owned(),
                );
                env.insert("FAKECHROOT_PATCH_ELFLOADER".to_owned(), loader_host);
            }
        }
        Ok(env)
    }

    fn patchelf_path(&self) -> PathBuf {
        self.common.config.patchelf_exec.clone().map_or_else(
            || {
                self.common
                    .config
                    .lib_dir
                    .join(format!("patchelf-{}", self.common.host.arch))
            },
            PathBuf::from,
        )
    }

    /// Replace a script's shebang invocation: the kernel would resolve
    /// the interpreter on the host, so it is resolved here instead. An
    /// interpreter missing from the container falls back to the patched
    /// loader where one exists, otherwise the run fails before exec.
    fn script_command(&self, exec_host: &str) -> Result<Option<Vec<String>>, EngineError> {
        let Ok(content) = fs::read(exec_host) else {
            return Ok(None);
        };
        if !content.starts_with(b"#!") {
            return Ok(None);
        }
        let Some(first_line) = content
            .split(|b| *b == b'\n')
            .next()
            .map(|l| String::from_utf8_lossy(&l[2..]).trim().to_owned())
        else {
            return Ok(None);
        };
        let mut tokens: Vec<String> =
            first_line.split_whitespace().map(str::to_owned).collect();
        if tokens.is_empty() {
            return Ok(None);
        }
        let interp_host = self.common.translator().cont2host(&tokens[0]);
        if Path::new(&interp_host).is_file() {
            tokens[0] = interp_host;
            return Ok(Some(tokens));
        }
        if self.uses_patched_loader() {
            let loader = self.patcher().container_loader_path()?;
            warn!(
                "shebang interpreter {} not in the container, using the loader",
                tokens[0]
            );
            tokens[0] = self.common.translator().cont2host(&loader);
            return Ok(Some(tokens));
        }
        Err(EngineError::MissingExecutable(format!(
            "script interpreter not found in the container: {}",
            tokens[0]
        )))
    }
}

impl ExecutionEngine for FakechrootEngine {
    fn run(&mut self, container_id: &str) -> Result<i32, EngineError> {
        let exec_path = self.common.run_init(container_id)?;

        // No privilege boundary exists under preload interception.
        if self.common.opts.uid == 0 && !self.common.host.is_root() {
            warn!(
                "running as uid 0 is not possible in mode {}, using {}",
                self.mode, self.common.host.username
            );
            self.common.opts.uid = self.common.host.uid;
            self.common.opts.gid = self.common.host.gid;
            self.common.opts.username = self.common.host.username.clone();
        }

        let library = self.select_library()?;
        let mut env = self.common.build_env();
        env.extend(self.fakechroot_env(&library)?);

        // The initial exec happens before the preload library is active,
        // so argv[0] must be the host path of the target.
        let translator = self.common.translator();
        let exec_host = translator.cont2host(&exec_path);
        let mut argv: Vec<String> = Vec::new();
        if let Some(interp) = self.script_command(&exec_host)? {
            argv.extend(interp);
            argv.push(exec_host);
        } else {
            argv.push(exec_host);
        }
        argv.extend(self.common.opts.cmd.iter().skip(1).cloned());
        info!("{}", argv.join(" "));

        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(&env)
            .current_dir(translator.cont2host(&self.common.opts.cwd))
            .status()?;
        Ok(child_code(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostinfo::HostInfo;
    use rootbox_store::layout::ROOT_SUBDIR;

    fn engine(dir: &Path, mode: &str) -> FakechrootEngine {
        let config = Config {
            topdir: dir.to_path_buf(),
            tmpdir: dir.join("tmp"),
            lib_dir: dir.join("lib"),
            ..Config::default()
        };
        let host = HostInfo {
            uid: 1000,
            gid: 1000,
            username: "tester".to_owned(),
            arch: "x86_64".to_owned(),
            kernel: "5.15.0".to_owned(),
        };
        let mut engine = FakechrootEngine {
            common: ExecutionEngineCommon::with_host(&config, RunOptions::default(), host),
            mode: mode.to_owned(),
        };
        engine.common.container_dir = dir.join("container");
        engine.common.root = engine.common.container_dir.join(ROOT_SUBDIR);
        fs::create_dir_all(&engine.common.root).unwrap();
        engine
    }

    #[test]
    fn library_candidates_prefer_guest_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F1");
        fs::create_dir_all(engine.common.root.join("etc")).unwrap();
        fs::write(
            engine.common.root.join("etc/os-release"),
            "ID=alpine\nVERSION_ID=3.19\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/libfakechroot-x86_64.so"), "so").unwrap();
        fs::write(
            dir.path().join("lib/libfakechroot-alpine3.19-x86_64.so"),
            "so",
        )
        .unwrap();

        let library = engine.select_library().unwrap();
        assert!(library
            .to_string_lossy()
            .ends_with("libfakechroot-alpine3.19-x86_64.so"));
    }

    #[test]
    fn missing_library_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F1");
        assert!(matches!(
            engine.select_library(),
            Err(EngineError::MissingExecutable(_))
        ));
    }

    #[test]
    fn f1_env_has_base_and_preload_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), "F1");
        engine
            .common
            .opts
            .vol
            .push(("/data".to_owned(), "/mnt".to_owned()));

        let env = engine
            .fakechroot_env(Path::new("/lib/libfakechroot.so"))
            .unwrap();
        assert!(env.contains_key("FAKECHROOT_BASE"));
        assert_eq!(
            env.get("LD_PRELOAD").map(String::as_str),
            Some("/lib/libfakechroot.so")
        );
        assert_eq!(
            env.get("FAKECHROOT_DIR_MAP").map(String::as_str),
            Some("/data!/mnt")
        );
        assert_eq!(
            env.get("FAKECHROOT_EXPAND_SYMLINKS").map(String::as_str),
            Some("true")
        );
        assert!(!env.contains_key("FAKECHROOT_ELFLOADER"));
    }

    #[test]
    fn access_whitelist_lists_only_present_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), "F1");
        let devices = dir.path().join("devices");
        fs::create_dir_all(&devices).unwrap();
        fs::write(devices.join("open-mx"), "").unwrap();
        engine
            .common
            .opts
            .vol
            .push((devices.to_string_lossy().into_owned(), "/dev".to_owned()));
        engine.common.config.access_files =
            vec!["/dev/open-mx".to_owned(), "/dev/ipath".to_owned()];

        let env = engine
            .fakechroot_env(Path::new("/lib/libfakechroot.so"))
            .unwrap();
        assert_eq!(
            env.get("FAKECHROOT_ACCESS_FILESOK").map(String::as_str),
            Some("/dev/open-mx")
        );
    }

    #[test]
    fn f3_env_carries_loader_and_real_library_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F3");
        fs::create_dir_all(engine.common.root.join("lib")).unwrap();
        fs::write(
            engine.common.root.join("lib/ld-linux-x86-64.so.2"),
            "elf",
        )
        .unwrap();
        fs::write(engine.common.root.join("lib/libc.so.6"), "elf").unwrap();

        let env = engine
            .fakechroot_env(Path::new("/lib/libfakechroot.so"))
            .unwrap();
        let loader = env.get("FAKECHROOT_ELFLOADER").unwrap();
        assert!(loader.ends_with("/lib/ld-linux-x86-64.so.2"));
        assert!(loader.starts_with('/'));
        assert!(env.get("LD_LIBRARY_REAL").unwrap().contains("/lib"));
        assert!(!env.contains_key("FAKECHROOT_PATCH_PATCHELF"));
    }

    #[test]
    fn f4_env_enables_on_the_fly_patching() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F4");
        fs::create_dir_all(engine.common.root.join("lib")).unwrap();
        fs::write(
            engine.common.root.join("lib/ld-musl-x86_64.so.1"),
            "elf",
        )
        .unwrap();

        let env = engine
            .fakechroot_env(Path::new("/lib/libfakechroot.so"))
            .unwrap();
        assert!(env.contains_key("FAKECHROOT_PATCH_PATCHELF"));
        assert!(env.contains_key("FAKECHROOT_PATCH_ELFLOADER"));
    }

    #[test]
    fn shebang_interpreter_is_host_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F1");
        fs::create_dir_all(engine.common.root.join("bin")).unwrap();
        fs::write(engine.common.root.join("bin/sh"), "elf").unwrap();
        let script = dir.path().join("script");
        fs::write(&script, "#!/bin/sh -e\necho hi\n").unwrap();

        let tokens = engine
            .script_command(&script.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].ends_with("/bin/sh"));
        assert!(tokens[0].starts_with(engine.common.root.to_str().unwrap()));
        assert_eq!(tokens[1], "-e");

        let binary = dir.path().join("binary");
        fs::write(&binary, [0x7f, b'E', b'L', b'F']).unwrap();
        assert!(engine
            .script_command(&binary.to_string_lossy())
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_shebang_interpreter_fails_without_patched_loader() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F1");
        let script = dir.path().join("script");
        fs::write(&script, "#!/usr/bin/nowhere\n").unwrap();

        assert!(matches!(
            engine.script_command(&script.to_string_lossy()),
            Err(EngineError::MissingExecutable(_))
        ));
    }

    #[test]
    fn missing_shebang_interpreter_falls_back_to_patched_loader() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "F3");
        fs::create_dir_all(engine.common.root.join("lib")).unwrap();
        fs::write(engine.common.root.join("lib/ld-linux-x86-64.so.2"), "elf").unwrap();
        let script = dir.path().join("script");
        fs::write(&script, "#!/usr/bin/nowhere -x\n").unwrap();

        let tokens = engine
            .script_command(&script.to_string_lossy())
            .unwrap()
            .unwrap();
        assert!(tokens[0].ends_with("/lib/ld-linux-x86-64.so.2"));
        assert!(tokens[0].starts_with(engine.common.root.to_str().unwrap()));
        assert_eq!(tokens[1], "-x");
    }
}
