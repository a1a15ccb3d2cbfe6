use crate::commands::EXIT_SUCCESS;
use rootbox_engine::Config;
use rootbox_store::LocalRepository;

pub fn run(config: &Config, container: &str, name: &str) -> Result<u8, String> {
    LocalRepository::new(&config.topdir)
        .set_container_name(container, name)
        .map_err(|e| e.to_string())?;
    println!("{name} -> {container}");
    Ok(EXIT_SUCCESS)
}
