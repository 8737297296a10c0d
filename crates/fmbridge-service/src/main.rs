//! FindMy-to-Traccar bridge service.
//!
//! Run with: `cargo run -p fmbridge-service`

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fmbridge_core::{
    AnisetteClient, AppleHttpClient, Beacon, CredentialStore, FindMyDecrypter, SessionManager,
};
use fmbridge_service::config::Config;
use fmbridge_service::forwarder::TraccarForwarder;
use fmbridge_service::scheduler::Scheduler;
use fmbridge_service::{init, plist_source};

/// FindMy-to-Traccar bridge: polls Apple's network for beacon location
/// reports and forwards them to a Traccar instance.
#[derive(Parser, Debug)]
#[command(name = "fmbridge")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Traccar OsmAnd endpoint URL (overrides config).
    #[arg(short, long, global = true)]
    traccar_url: Option<String>,

    /// Data directory for session material (overrides config).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Poll interval in seconds (overrides config).
    #[arg(short, long, global = true)]
    interval: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the polling bridge in the foreground (default behavior).
    Run,

    /// Authenticate the Apple account interactively and persist the session.
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fmbridge_service=info".parse()?)
                .add_directive("fmbridge_core=info".parse()?),
        )
        .init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Init) => run_init(config).await,
        Some(Command::Run) | None => run_bridge(config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    config.apply_env();

    // CLI overrides win over both file and environment.
    if let Some(url) = &args.traccar_url {
        config.traccar.url = url.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(interval) = args.interval {
        config.poll.interval_secs = interval;
    }

    config.validate()?;
    Ok(config)
}

fn build_session(
    config: &Config,
) -> anyhow::Result<SessionManager<AppleHttpClient, AnisetteClient>> {
    let anisette = AnisetteClient::new(config.anisette.url.clone())?;
    let api = AppleHttpClient::new(config.apple.auth_url.clone(), config.apple.fetch_url.clone())?;
    let store = CredentialStore::new(config.storage.data_dir.clone());
    Ok(SessionManager::new(api, anisette, store))
}

async fn run_init(config: Config) -> anyhow::Result<()> {
    let mut session = build_session(&config)?;

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    init::run_init(&mut session, &mut input, &mut output).await
}

async fn run_bridge(config: Config) -> anyhow::Result<()> {
    let beacons: Vec<Beacon> = config
        .beacons
        .iter()
        .map(|b| Beacon::from_b64(&b.private_key, b.label.clone()))
        .collect::<Result<_, _>>()?;
    for beacon in &beacons {
        info!(
            "tracking {} (device id {})",
            beacon.display_name(),
            beacon.id().device_id()
        );
    }

    let mut session = build_session(&config)?;
    session.restore()?;
    if !session.is_ready() && !beacons.is_empty() {
        warn!("no authenticated session; run 'fmbridge init' to start polling");
    }

    let forwarder = TraccarForwarder::new(config.traccar.url.clone())?;
    let store = CredentialStore::new(config.storage.data_dir.clone());
    let scheduler = Scheduler::new(
        session,
        beacons,
        FindMyDecrypter::new(),
        forwarder,
        plist_source(&config),
        store,
        Duration::from_secs(config.poll.interval_secs),
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.run(stop_rx));

    info!(
        "bridge running; polling every {}s, forwarding to {}",
        config.poll.interval_secs, config.traccar.url
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = stop_tx.send(true);
    handle.await?;
    Ok(())
}
