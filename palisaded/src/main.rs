//! # Palisade Supervisor
//!
//! Thin process wrapper around the data-plane runtime: load the
//! configuration, initialize tracing, bring the runtime up, register the
//! configured backends, then wait for a termination signal and shut down
//! in order.

use clap::Parser;
use palisade::params::Params;
use palisade_core::{BackendDef, ProbeDef, Runtime};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "palisaded", about = "reverse-proxy cache data-plane runtime")]
struct Args {
    /// Configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the shared-memory arena.
    #[arg(short = 'n', long, default_value = "./palisade")]
    dir: PathBuf,

    /// Tracing filter (overrides RUST_LOG).
    #[arg(long)]
    log_filter: Option<String>,
}

/// One `[[backend]]` table in the configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendConfig {
    name: String,
    #[serde(default)]
    v4: Option<std::net::SocketAddr>,
    #[serde(default)]
    v6: Option<std::net::SocketAddr>,
    #[serde(default = "default_proto")]
    proto: String,
    #[serde(default)]
    probe: bool,
}

fn default_proto() -> String {
    "http".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default)]
    params: Params,
    #[serde(default)]
    backend: Vec<BackendConfig>,
}

fn init_tracing(filter: Option<&str>) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::from_default_env(),
    };
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_sig: i32) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).expect("install SIGINT handler");
        sigaction(Signal::SIGTERM, &action).expect("install SIGTERM handler");
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config: Config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        }
        None => Config::default(),
    };
    config.params.validate()?;

    let rt = Runtime::new(config.params.clone(), &args.dir)?;
    rt.install_panic_hook()?;
    info!(dir = %args.dir.display(), "arena at {}", rt.arena.path().display());

    for bc in &config.backend {
        if bc.v4.is_none() && bc.v6.is_none() {
            error!(backend = %bc.name, "skipped: no address");
            continue;
        }
        let def = BackendDef {
            name: bc.name.clone(),
            v4: bc.v4,
            v6: bc.v6,
            proto: bc.proto.clone(),
            probe: bc
                .probe
                .then(|| ProbeDef::from_params(&config.params)),
        };
        let be = rt.new_backend(def);
        info!(backend = %be.name, "registered");
    }

    install_signal_handlers();
    info!("running, ^C to stop");
    while RUNNING.load(Ordering::SeqCst) {
        palisade::vtim::sleep(0.25);
    }

    info!("signal received, shutting down");
    rt.shutdown();
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());
    if let Err(e) = run(args) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}
