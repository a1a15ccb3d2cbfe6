use crate::commands::{container_dir, parse_env_pair, parse_portmap, patchelf_path};
use rootbox_engine::elfpatch::PatchElfTool;
use rootbox_engine::engines::{engine_for, exit_status};
use rootbox_engine::pathtrans::split_volume_spec;
use rootbox_engine::{Config, ExecMode, RunOptions};
use rootbox_store::StrOrList;
use tracing::debug;

/// The `run` subcommand's raw arguments, still unparsed.
pub struct RunArgs {
    pub env: Vec<String>,
    pub volume: Vec<String>,
    pub novol: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub entrypoint: Option<String>,
    pub hostname: String,
    pub domainname: String,
    pub publish: Vec<String>,
    pub device: Vec<String>,
    pub nometa: bool,
    pub nosysdirs: bool,
    pub hostauth: bool,
    pub bindhome: bool,
    pub nodri: bool,
    pub netcoop: bool,
    pub nvidia: bool,
    pub fresh_spec: bool,
    pub tty: bool,
    pub kernel: Option<String>,
    pub cpuset: Option<String>,
    pub command: Vec<String>,
}

pub(crate) fn build_options(args: RunArgs) -> Result<RunOptions, String> {
    let mut opts = RunOptions {
        user: args.user,
        cwd: args.workdir,
        hostname: args.hostname,
        domainname: args.domainname,
        devices: args.device,
        nometa: args.nometa,
        nosysdirs: args.nosysdirs,
        hostauth: args.hostauth,
        bindhome: args.bindhome,
        nodri: args.nodri,
        netcoop: args.netcoop,
        nvidia: args.nvidia,
        fresh_spec: args.fresh_spec,
        tty: args.tty,
        kernel: args.kernel,
        cpuset: args.cpuset,
        novol: args.novol,
        cmd: args.command,
        entrypoint: args.entrypoint.map(StrOrList::Str),
        ..RunOptions::default()
    };
    for spec in &args.env {
        opts.env.push(parse_env_pair(spec)?);
    }
    for spec in &args.volume {
        opts.vol.push(split_volume_spec(spec));
    }
    for spec in &args.publish {
        opts.portsmap.push(parse_portmap(spec)?);
    }
    Ok(opts)
}

pub fn run(config: &Config, container: &str, args: RunArgs) -> Result<u8, String> {
    let opts = build_options(args)?;
    let cdir = container_dir(config, container)?;

    let patcher = PatchElfTool::new(&cdir, patchelf_path(config));
    let mode = ExecMode::new(&cdir, &config.default_mode, &patcher).get_mode();
    debug!("running {container} in mode {mode}");

    let mut engine = engine_for(&mode, config, opts).map_err(|e| e.to_string())?;
    let code = exit_status(engine.run(container));
    Ok(u8::try_from(code & 0xff).unwrap_or(2))
}
