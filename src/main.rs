use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use plugin_host::config::HostConfig;
use plugin_host::demo::{demo_bridge, run_demo};
use plugin_host::logger::init_tracing;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "plugin_host",
    about = "Runs plugin workers behind a host capability bridge",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a demo plugin worker and run its full lifecycle
    Demo(DemoArgs),

    /// List the channels the demo bridge exposes
    Channels,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Per-call timeout, overrides PLUGIN_HOST_CALL_TIMEOUT_MS
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = HostConfig::from_env()?;

    match cli.command {
        Commands::Demo(args) => {
            if let Some(ms) = args.timeout_ms.filter(|ms| *ms > 0) {
                config.call_timeout = Duration::from_millis(ms);
            }
            if let Some(level) = args.log_level {
                config.log_level = level;
            }
            if args.log_dir.is_some() {
                config.log_dir = args.log_dir;
            }
            init_tracing(&config.log_level, config.log_dir.as_deref())?;
            info!(timeout_ms = %config.call_timeout.as_millis(), "running plugin host demo");

            match run_demo(&config).await {
                Ok(steps) => {
                    for (step, result) in steps {
                        println!("✅ {step}: {result}");
                    }
                    Ok(())
                }
                Err(err) => {
                    error!("demo failed: {err:#}");
                    Err(err)
                }
            }
        }
        Commands::Channels => {
            for channel in demo_bridge()?.list_channels() {
                println!("{channel}");
            }
            Ok(())
        }
    }
}
