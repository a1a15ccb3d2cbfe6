use crate::commands::{container_dir, patchelf_path, EXIT_SUCCESS};
use rootbox_engine::elfpatch::PatchElfTool;
use rootbox_engine::{Config, ExecMode};

pub fn get(config: &Config, container: &str) -> Result<u8, String> {
    let cdir = container_dir(config, container)?;
    let patcher = PatchElfTool::new(&cdir, patchelf_path(config));
    let mode = ExecMode::new(&cdir, &config.default_mode, &patcher);
    println!("{}", mode.get_mode());
    Ok(EXIT_SUCCESS)
}

pub fn set(config: &Config, container: &str, target: &str, force: bool) -> Result<u8, String> {
    let cdir = container_dir(config, container)?;
    let patcher = PatchElfTool::new(&cdir, patchelf_path(config));
    let mode = ExecMode::new(&cdir, &config.default_mode, &patcher);
    mode.set_mode(&target.to_uppercase(), force)
        .map_err(|e| e.to_string())?;
    println!("{container}: {}", mode.get_mode());
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rootbox_store::LocalRepository;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            topdir: dir.to_path_buf(),
            tmpdir: dir.join("tmp"),
            lib_dir: dir.join("lib"),
            ..Config::default()
        }
    }

    #[test]
    fn get_reports_default_for_fresh_container() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        LocalRepository::new(&config.topdir)
            .create_container("abc")
            .unwrap();
        assert_eq!(get(&config, "abc").unwrap(), EXIT_SUCCESS);
    }

    #[test]
    fn set_between_plain_modes_commits() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        LocalRepository::new(&config.topdir)
            .create_container("abc")
            .unwrap();
        // P1 -> P2 needs no tree conversion, so no tools are required
        assert_eq!(set(&config, "abc", "p2", false).unwrap(), EXIT_SUCCESS);

        let cdir = container_dir(&config, "abc").unwrap();
        let patcher = PatchElfTool::new(&cdir, patchelf_path(&config));
        let mode = ExecMode::new(&cdir, &config.default_mode, &patcher);
        assert_eq!(mode.get_mode(), "P2");
    }

    #[test]
    fn set_rejects_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        LocalRepository::new(&config.topdir)
            .create_container("abc")
            .unwrap();
        assert!(set(&config, "abc", "Z9", false).is_err());
    }

    #[test]
    fn missing_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(get(&config, "nope").is_err());
    }
}
