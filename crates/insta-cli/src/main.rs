mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{exit_code_for, EXIT_FAILURE};
use insta_core::{install_signal_handler, InfraManager, InstaConfig};
use insta_runtime::{ContainerRuntime, Provider};
use insta_schema::ServiceRegistry;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "insta",
    version,
    about = "Run pre-configured infrastructure services locally on Docker or Podman"
)]
struct Cli {
    /// Container runtime to use (docker or podman). Detected when omitted.
    #[arg(long, global = true)]
    runtime: Option<String>,

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
    /// Start a service and the services it depends on.
    Up {
        service: String,
        /// Mount the persistent volumes from docker-compose-persist.yaml.
        #[arg(long, default_value_t = false)]
        persist: bool,
        /// Pull missing images with progress before starting.
        #[arg(long, default_value_t = false)]
        pull: bool,
    },
    /// Stop a service and the dependencies nothing else still needs.
    Down {
        /// Service to stop; every service when omitted.
        service: Option<String>,
    },
    /// Show service status.
    Status {
        /// Only this service (prints the canonical status token).
        service: Option<String>,
    },
    /// List known services.
    List,
    /// Show the transitive dependencies of a service.
    Deps { service: String },
    /// Show the services that depend directly on a service.
    Dependents { service: String },
    /// Print every dependency edge.
    Graph,
    /// Show container logs.
    Logs {
        service: String,
        /// Number of lines from the end of the log.
        #[arg(long)]
        tail: Option<usize>,
        /// Keep streaming new output until interrupted.
        #[arg(short, long, default_value_t = false)]
        follow: bool,
    },
    /// Pull an image, or every missing image of a service.
    Pull { target: String },
    /// Check which images a service needs are present locally.
    Images { service: String },
    /// Run a command inside a service container.
    Exec {
        service: String,
        /// Attach a terminal.
        #[arg(short = 't', long, default_value_t = false)]
        interactive: bool,
        /// Command to run (after --).
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Open the service's client shell (e.g. psql, redis-cli).
    Connect { service: String },
    /// Show published ports of a service.
    Ports { service: String },
    /// Check container runtimes and suggest or apply a fix.
    Doctor {
        /// Try to start the runtime daemon or machine.
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
    /// Print the effective configuration.
    Config,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
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
            tracing_subscriber::EnvFilter::try_from_env("INSTA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let result = run(cli);
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn run(cli: Cli) -> Result<u8, String> {
    let json = cli.json;
    // Commands that never touch a runtime.
    match &cli.command {
        Commands::Completions { shell } => return commands::completions::run::<Cli>(*shell),
        Commands::Config => {
            let config = load_config(cli.runtime.as_deref())?;
            return commands::config::run(&config, json);
        }
        Commands::Doctor { fix } => {
            let config = load_config(cli.runtime.as_deref())?;
            return commands::doctor::run(&config, *fix, json);
        }
        _ => {}
    }

    let config = load_config(cli.runtime.as_deref())?;
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))?;
    let runtime = select_runtime(&config)?;
    let registry = match &config.registry_path {
        Some(path) => ServiceRegistry::load(path).map_err(|e| e.to_string())?,
        None => ServiceRegistry::empty(),
    };
    let manager = InfraManager::new(config, runtime, registry, tokio_rt.handle().clone());

    let code = match cli.command {
        Commands::Up {
            service,
            persist,
            pull,
        } => commands::up::run(&manager, &tokio_rt, &service, persist, pull, json),
        Commands::Down { service } => commands::stop::run(&manager, service.as_deref(), json),
        Commands::Status { service } => {
            commands::status::run(&manager, service.as_deref(), json)
        }
        Commands::List => commands::list::run(&manager, json),
        Commands::Deps { service } => commands::deps::dependencies(&manager, &service, json),
        Commands::Dependents { service } => commands::deps::dependents(&manager, &service, json),
        Commands::Graph => commands::deps::graph(&manager, json),
        Commands::Logs {
            service,
            tail,
            follow,
        } => commands::logs::run(&manager, &service, tail, follow, json),
        Commands::Pull { target } => commands::pull::run(&manager, &tokio_rt, &target, json),
        Commands::Images { service } => commands::images::run(&manager, &service, json),
        Commands::Exec {
            service,
            interactive,
            command,
        } => commands::exec::run(&manager, &service, &command.join(" "), interactive, json),
        Commands::Connect { service } => commands::exec::connect(&manager, &service),
        Commands::Ports { service } => commands::ports::run(&manager, &service, json),
        // Handled before a runtime is selected.
        Commands::Completions { .. } | Commands::Config | Commands::Doctor { .. } => {
            Ok(EXIT_FAILURE)
        }
    };
    manager.stop_streams();
    code
}

fn load_config(runtime_flag: Option<&str>) -> Result<InstaConfig, String> {
    let mut config = InstaConfig::load_default().map_err(|e| e.to_string())?;
    if let Some(name) = runtime_flag {
        config.preferred_runtime = Some(name.trim().to_ascii_lowercase());
        config.validate().map_err(|e| e.to_string())?;
    }
    Ok(config)
}

fn select_runtime(config: &InstaConfig) -> Result<Arc<dyn ContainerRuntime>, String> {
    let provider = Provider::with_settings(&config.runtime_settings());
    let selected = match &config.preferred_runtime {
        Some(name) => provider.select(name),
        None => provider.detect(),
    };
    selected.map_err(|e| format!("runtime error: {e}"))
}
