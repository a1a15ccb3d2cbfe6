use crate::commands::{json_pretty, patchelf_path, EXIT_SUCCESS};
use rootbox_engine::elfpatch::PatchElfTool;
use rootbox_engine::{Config, ExecMode};
use rootbox_store::LocalRepository;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ContainerRow {
    id: String,
    names: Vec<String>,
    mode: String,
    command: Option<String>,
}

fn collect(config: &Config) -> Vec<ContainerRow> {
    let repo = LocalRepository::new(&config.topdir);
    let patchelf = patchelf_path(config);
    repo.list_containers()
        .into_iter()
        .map(|id| {
            let mode = repo
                .container_dir(&id)
                .map(|cdir| {
                    let patcher = PatchElfTool::new(&cdir, &patchelf);
                    ExecMode::new(&cdir, &config.default_mode, &patcher).get_mode()
                })
                .unwrap_or_else(|_| config.default_mode.clone());
            let command = repo
                .load_metadata(&id)
                .ok()
                .flatten()
                .and_then(|meta| {
                    meta.effective_config()
                        .and_then(|c| c.cmd.as_ref().map(|cmd| cmd.to_vec().join(" ")))
                });
            ContainerRow {
                names: repo.get_container_name(&id),
                id,
                mode,
                command,
            }
        })
        .collect()
}

pub fn run(config: &Config, json_output: bool) -> Result<u8, String> {
    let rows = collect(config);
    if json_output {
        println!("{}", json_pretty(&rows)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<20} {:<5} {:<20} COMMAND", "CONTAINER ID", "MODE", "NAMES");
    for row in rows {
        println!(
            "{:<20} {:<5} {:<20} {}",
            row.id,
            row.mode,
            row.names.join(","),
            row.command.unwrap_or_default()
        );
    }
    Ok(EXIT_SUCCESS)
}
