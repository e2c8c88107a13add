use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hearth_hub::api::ApiServer;
use hearth_hub::store::Store;
use hearth_hub::{Config, EnrollmentPolicy, Hub, KeyIdentity};

/// Hearth - coordination hub for home-automation nodes
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "HEARTH_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "HEARTH_HOST")]
    host: Option<String>,

    /// Directory for the hub identity and snapshots
    #[arg(long, env = "HEARTH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to ~/.config/hearth/config.toml)
    #[arg(short, long, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enrollment policy: manual or auto
    #[arg(long, env = "HEARTH_ENROLLMENT")]
    enrollment: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the hub public key and data directory
    Identity,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hearth: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose, config.log_level.as_deref()))
        .init();

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Verbosity flags win, then `RUST_LOG`, then the configured level
fn log_filter(verbose: u8, configured: Option<&str>) -> EnvFilter {
    let filter = match verbose {
        0 => None,
        1 => Some("info,hearth=debug,hearth_hub=debug"),
        2 => Some("debug"),
        _ => Some("trace"),
    };

    if let Some(filter) = filter {
        return EnvFilter::new(filter);
    }

    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or("info,hearth=info,hearth_hub=info")))
}

/// Config file and environment, then command-line overrides
fn load_config(cli: &Cli) -> hearth_hub::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    if let Some(policy) = &cli.enrollment {
        config.enrollment = EnrollmentPolicy::from_str(policy);
    }

    Ok(config)
}

async fn run(command: Option<Command>, config: Config) -> anyhow::Result<()> {
    if let Some(Command::Identity) = command {
        return show_identity(&config);
    }

    let hub = Hub::open(config)?;
    let persister = hub.spawn_persister();

    let signal_hub = hub.clone();
    let shutdown = async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
        }
        signal_hub.begin_shutdown();
    };

    ApiServer::new(hub.clone()).run(shutdown).await?;

    // The server has stopped accepting requests; flush whatever they changed
    persister.await?;
    hub.shutdown().await?;

    tracing::info!("hub stopped");
    Ok(())
}

fn show_identity(config: &Config) -> anyhow::Result<()> {
    let store = Store::new(&config.data_dir);
    let identity = KeyIdentity::load_or_create(&store.identity_path(), &config.name)?;

    println!("hub:         {}", identity.name);
    println!("fingerprint: {}", identity.fingerprint);
    println!("public key:  {}", identity.public_key);
    println!("data dir:    {}", store.dir().display());
    Ok(())
}
