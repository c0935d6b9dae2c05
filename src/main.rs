//! Vantage - health-probe collector.
//!
//! Periodically checks every configured service from this probe's
//! viewpoint and records the results in SQLite.

mod config;
mod db;
mod identity;
mod inventory;
mod probe;
mod scheduler;

use std::error::Error;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::Store;
use identity::{HttpGeoDiscovery, IdentityResolver, ProbeOverride};
use probe::{CheckSettings, NetworkChecks};
use scheduler::Collector;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "vantage", version, about = "Health-probe collector")]
struct Cli {
    /// Path to the TOML config file (default: $VANTAGE_CONFIG or config/vantage.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run measurement cycles until interrupted (default)
    Run,
    /// Run a single cycle and exit
    Once,
    /// Print the most recently stored measurements
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();
    if let Err(e) = until_interrupted(run(cli), tokio::signal::ctrl_c()).await {
        tracing::error!("{}", error_chain(&*e));
        std::process::exit(1);
    }
}

/// Drive `work` to completion unless `interrupt` resolves first, which is
/// a clean shutdown.
async fn until_interrupted<W, I>(work: W, interrupt: I) -> Result<(), BoxError>
where
    W: Future<Output = Result<(), BoxError>>,
    I: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = work => result,
        signal = interrupt => {
            signal?;
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

/// An error followed by every error in its `source` chain.
fn error_chain(e: &(dyn Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn init_tracing() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("vantage=info".parse()?))
        .try_init()?;
    Ok(())
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config_path = Config::locate(cli.config);
    let cfg = Config::load(&config_path)?;
    tracing::info!("Loaded configuration from {}", config_path.display());

    let store = Arc::new(Store::new(&cfg.storage.db_path)?);
    tracing::info!("Using database at {}", cfg.storage.db_path.display());

    let command = cli.command.unwrap_or(Command::Run);
    if let Command::Recent { limit } = command {
        return print_recent(&store, limit);
    }

    let hosts = inventory::load_hosts(&cfg.collector.hosts_path)?;
    let services_path = cfg.collector.services_path.clone();
    let load_services = move || inventory::load_services(&services_path);
    // Fail before identity discovery if the service list is unreadable.
    let services = load_services()?;
    tracing::info!("Loaded {} hosts and {} enabled services", hosts.len(), services.len());

    let resolver = IdentityResolver::new(
        ProbeOverride::from_env(),
        cfg.probe.cache_path.clone(),
        HttpGeoDiscovery::new(&cfg.probe)?,
    );
    let identity = resolver.resolve(&cfg.region).await;
    tracing::info!(
        "Probe identity: region={} country={} city={} public_ip={} source={}",
        identity.region,
        identity.country.as_deref().unwrap_or("-"),
        identity.city.as_deref().unwrap_or("-"),
        identity.public_ip.as_deref().unwrap_or("-"),
        identity.source
    );

    let settings = CheckSettings {
        timeouts: cfg.collector.timeouts,
        thresholds: cfg.collector.thresholds,
        dns_server: cfg.collector.dns_server.clone(),
    };
    let collector = Collector::new(
        NetworkChecks,
        settings,
        hosts,
        identity,
        store,
        cfg.collector.max_workers,
    );

    if command == Command::Once {
        collector.run_cycle(&services).await;
        return Ok(());
    }

    tracing::info!(
        "Starting collector: interval {}s, {} workers",
        cfg.collector.interval_sec,
        cfg.collector.max_workers
    );
    match collector.run_forever(cfg.interval(), load_services).await {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}

fn print_recent(store: &Store, limit: u32) -> Result<(), BoxError> {
    for m in store.recent_measurements(limit)? {
        println!(
            "{}  {:<4} {:<8} {:<24} status={} latency_ms={:<6} {}",
            m.ts.format("%Y-%m-%d %H:%M:%S"),
            m.region,
            m.kind,
            m.target_id,
            m.status,
            m.latency_ms,
            serde_json::Value::Object(m.meta)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["vantage"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_cli_subcommands() {
        let cli = Cli::try_parse_from(["vantage", "once", "--config", "/etc/vantage.toml"]).unwrap();
        assert_eq!(cli.command, Some(Command::Once));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vantage.toml")));

        let cli = Cli::try_parse_from(["vantage", "recent", "-l", "5"]).unwrap();
        assert_eq!(cli.command, Some(Command::Recent { limit: 5 }));

        assert!(Cli::try_parse_from(["vantage", "serve"]).is_err());
    }

    #[tokio::test]
    async fn test_interrupt_ends_work_cleanly() {
        let work = std::future::pending::<Result<(), BoxError>>();
        let result = until_interrupted(work, async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_work_error_surfaces_without_interrupt() {
        let work = async { Err::<(), BoxError>("services file vanished".into()) };
        let result = until_interrupted(work, std::future::pending()).await;
        assert_eq!(result.unwrap_err().to_string(), "services file vanished");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = config::ConfigError::Read {
            path: PathBuf::from("/etc/vantage.toml"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied"),
        };
        let text = error_chain(&err);
        assert!(text.starts_with("failed to read /etc/vantage.toml"));
        assert!(text.ends_with("caused by: access denied"));
    }
}
