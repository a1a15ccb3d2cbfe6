mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "rootbox",
    version,
    about = "Run container image rootfs trees as unprivileged processes"
)]
struct Cli {
    /// Top directory of the local container repository.
    #[arg(long, default_value = "~/.rootbox")]
    topdir: String,

    /// Configuration file overriding the built-in defaults.
    #[arg(long)]
    config: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a command inside a container (use -- before the command).
    Run {
        /// Container id or name.
        container: String,
        /// Environment variables (KEY=VALUE).
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Volume bindings (host[:container]).
        #[arg(short = 'v', long = "volume")]
        volume: Vec<String>,
        /// Exclude a host path, container path, or host:container binding.
        #[arg(long)]
        novol: Vec<String>,
        /// Run as this user ("uid:gid" or a username).
        #[arg(short, long, default_value = "")]
        user: String,
        /// Working directory inside the container.
        #[arg(short = 'w', long, default_value = "")]
        workdir: String,
        /// Override the image entrypoint (split on spaces).
        #[arg(long)]
        entrypoint: Option<String>,
        /// Hostname inside the container.
        #[arg(long, default_value = "")]
        hostname: String,
        /// Domain name inside the container.
        #[arg(long, default_value = "")]
        domainname: String,
        /// Map a host port onto a container port (host:container).
        #[arg(short = 'p', long = "publish")]
        publish: Vec<String>,
        /// Make a host device available (R1 only).
        #[arg(long)]
        device: Vec<String>,
        /// Ignore the image metadata.
        #[arg(long, default_value_t = false)]
        nometa: bool,
        /// Do not bind the default host system directories.
        #[arg(long, default_value_t = false)]
        nosysdirs: bool,
        /// Resolve users against the host passwd/group files.
        #[arg(long, default_value_t = false)]
        hostauth: bool,
        /// Bind the invoking user's home directory.
        #[arg(long, default_value_t = false)]
        bindhome: bool,
        /// Do not bind the host DRI directories.
        #[arg(long, default_value_t = false)]
        nodri: bool,
        /// Cooperative networking (P modes).
        #[arg(long, default_value_t = false)]
        netcoop: bool,
        /// Make the host NVIDIA devices available.
        #[arg(long, default_value_t = false)]
        nvidia: bool,
        /// Regenerate the OCI runtime spec (R1 only).
        #[arg(long, default_value_t = false)]
        fresh_spec: bool,
        /// Allocate a terminal for the container process.
        #[arg(short = 't', long, default_value_t = false)]
        tty: bool,
        /// Kernel version reported inside the container (P modes).
        #[arg(long)]
        kernel: Option<String>,
        /// Pin the container to a cpu list (e.g. "0-3").
        #[arg(long)]
        cpuset: Option<String>,
        /// Command and arguments (after --); defaults to the image command.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Show or change a container's execution mode.
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },
    /// List the containers in the local repository.
    Ps,
    /// Give a container a human-readable name.
    Name {
        /// Container id.
        container: String,
        /// Name to attach.
        name: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum ModeAction {
    /// Print the committed execution mode.
    Get {
        /// Container id or name.
        container: String,
    },
    /// Convert the container to another execution mode.
    Set {
        /// Container id or name.
        container: String,
        /// Target mode (P1, P2, F1, F2, F3, F4, R1, S1).
        mode: String,
        /// Commit the mode even if a conversion step fails.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ROOTBOX_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = match commands::load_config(&cli.topdir, cli.config.as_deref()) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Run {
            container,
            env,
            volume,
            novol,
            user,
            workdir,
            entrypoint,
            hostname,
            domainname,
            publish,
            device,
            nometa,
            nosysdirs,
            hostauth,
            bindhome,
            nodri,
            netcoop,
            nvidia,
            fresh_spec,
            tty,
            kernel,
            cpuset,
            command,
        } => commands::run::run(
            &config,
            &container,
            commands::run::RunArgs {
                env,
                volume,
                novol,
                user,
                workdir,
                entrypoint,
                hostname,
                domainname,
                publish,
                device,
                nometa,
                nosysdirs,
                hostauth,
                bindhome,
                nodri,
                netcoop,
                nvidia,
                fresh_spec,
                tty,
                kernel,
                cpuset,
                command,
            },
        ),
        Commands::Mode { action } => match action {
            ModeAction::Get { container } => commands::mode::get(&config, &container),
            ModeAction::Set {
                container,
                mode,
                force,
            } => commands::mode::set(&config, &container, &mode, force),
        },
        Commands::Ps => commands::ps::run(&config, json_output),
        Commands::Name { container, name } => commands::name::run(&config, &container, &name),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
