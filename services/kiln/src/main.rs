//! The `kiln` registry server.

use std::net::SocketAddr;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::WrapErr as _;
use kiln::{BackendRegistry, KilnConfig, RegistryBuilder};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "kiln", author, version, about, long_about = None)]
struct Cli {
    /// Log filter, used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the registry.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Backend URL, e.g. file:///var/cache/kiln or registry://ghcr.io/org.
    #[arg(long)]
    backend: Option<String>,

    /// Branch that `latest` resolves to.
    #[arg(long)]
    default_branch: Option<String>,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let (text, json) = match cli.log_format {
        LogFormat::Text => (Some(fmt::layer().with_target(false)), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

/// A backend URL with any password removed, for logging.
fn redacted(backend: &str) -> String {
    match url::Url::parse(backend) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => backend.to_owned(),
    }
}

async fn load_config(args: ServeArgs) -> eyre::Result<KilnConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let document = tokio::fs::read_to_string(path)
                .await
                .wrap_err_with(|| format!("reading {path}"))?;
            KilnConfig::from_toml(&document).wrap_err_with(|| format!("parsing {path}"))?
        }
        None => KilnConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(branch) = args.default_branch {
        config.default_branch = branch;
    }
    Ok(config)
}

async fn serve(args: ServeArgs) -> eyre::Result<()> {
    let config = load_config(args).await?;

    let backends = BackendRegistry::with_defaults();
    let backend = backends
        .open(&config.backend)
        .wrap_err_with(|| format!("opening backend {}", redacted(&config.backend)))?;

    let router = RegistryBuilder::new()
        .backend(backend)
        .builder(Arc::new(config.command_builder()))
        .default_branch(config.default_branch.clone())
        .build();

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!(
        listen = %config.listen,
        backend = %redacted(&config.backend),
        default_branch = %config.default_branch,
        "kiln listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown())
        .await
        .wrap_err("serving")?;
    Ok(())
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}
