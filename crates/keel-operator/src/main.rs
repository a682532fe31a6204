//! Keel - leader-elected ingress controller

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keel_common::{ArgsConfigLoader, ExecutionContext, LaunchArgs};
use keel_operator::{run_to_exit, Launcher, ProcessExit};

/// Keel - bootstrap and run the ingress controller
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    launch: LaunchArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let ctx = ExecutionContext::from_signals("keel")?;

    let launcher = Launcher::new(ArgsConfigLoader::new(cli.launch));
    run_to_exit(launcher, ctx, &ProcessExit).await;
    Ok(())
}
