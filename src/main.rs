//! JuiceFS cache group operator entry point

use clap::{Parser, Subcommand};
use kube::Client;

use juicefs_operator::config::ControllerConfig;
use juicefs_operator::crd::all_crds;
use juicefs_operator::runner;
use juicefs_operator::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Kubernetes operator for JuiceFS cache groups and cache warm-up
#[derive(Parser, Debug)]
#[command(name = "juicefs-cache-group-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log line format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    Controller(ControllerConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let docs = all_crds()
            .iter()
            .map(serde_yaml::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("failed to serialize CRDs: {e}"))?;
        print!("{}", docs.join("---\n"));
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        verbosity: cli.verbose,
        format: cli.log_format,
    })?;

    let config = match cli.command {
        Some(Commands::Controller(config)) => config,
        None => ControllerConfig::default(),
    };

    tracing::info!(
        concurrency = config.concurrency,
        watch_namespace = ?config.watch_namespace,
        "starting juicefs cache group operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;

    if let Err(e) = runner::run(client, config).await {
        tracing::error!(error = %e, "operator failed");
        std::process::exit(1);
    }

    tracing::info!("operator stopped");
    Ok(())
}
