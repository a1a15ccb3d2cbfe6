pub mod completions;
pub mod mode;
pub mod name;
pub mod ps;
pub mod run;

use rootbox_engine::Config;
use std::path::PathBuf;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Build the effective configuration: defaults, then the config file (the
/// given one or `<topdir>/rootbox.toml`), then the --topdir flag on top.
pub fn load_config(topdir: &str, config_file: Option<&str>) -> Result<Config, String> {
    let topdir = expand_tilde(topdir);
    let path = config_file
        .map(PathBuf::from)
        .unwrap_or_else(|| topdir.join("rootbox.toml"));
    let mut config = Config::load_overlay(&path).map_err(|e| e.to_string())?;
    // lib_dir follows topdir unless the config file pinned it explicitly
    if config.lib_dir == Config::default().lib_dir {
        config.lib_dir = topdir.join("lib");
    }
    config.topdir = topdir;
    Ok(config)
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Split one `KEY=VALUE` environment argument.
pub fn parse_env_pair(spec: &str) -> Result<(String, String), String> {
    spec.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("invalid environment variable '{spec}', expected KEY=VALUE"))
}

/// Split one `host:container` port mapping.
pub fn parse_portmap(spec: &str) -> Result<(u32, u32), String> {
    let err = || format!("invalid port mapping '{spec}', expected HOST:CONTAINER");
    let (host, container) = spec.split_once(':').ok_or_else(err)?;
    Ok((
        host.parse().map_err(|_| err())?,
        container.parse().map_err(|_| err())?,
    ))
}

pub fn container_dir(config: &Config, container: &str) -> Result<PathBuf, String> {
    rootbox_store::LocalRepository::new(&config.topdir)
        .container_dir(container)
        .map_err(|e| e.to_string())
}

/// patchelf binary used for mode conversions: override or bundled build.
pub fn patchelf_path(config: &Config) -> PathBuf {
    config.patchelf_exec.clone().map_or_else(
        || {
            let host = rootbox_engine::HostInfo::detect();
            config.lib_dir.join(format!("patchelf-{}", host.arch))
        },
        PathBuf::from,
    )
}
