mod config_commands;
mod console;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::Context as _,
    clap::{Parser, Subcommand},
    courier_auto_reply::{GeneratorRegistry, Pipeline},
    courier_channels::ChannelRegistry,
    courier_config::{CourierConfig, Severity},
    courier_dispatch::Dispatcher,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "courier", about = "Courier: session-aware message dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in the working and config directories).
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch stdin lines through the console transport (default).
    Run {
        /// Delay before the echo generator answers, in milliseconds.
        #[arg(long, default_value_t = 0)]
        echo_delay_ms: u64,
    },
    /// Validate the configuration file and report errors and warnings.
    CheckConfig {
        /// Show informational diagnostics too.
        #[arg(long)]
        verbose: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so replies on stdout stay readable.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CourierConfig> {
    let config = match path {
        Some(path) => courier_config::load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => courier_config::discover_and_load(),
    };

    let diagnostics = courier_config::validate::check_config(&config);
    for d in &diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            Severity::Warning => warn!(path = %d.path, "{}", d.message),
            Severity::Info => info!(path = %d.path, "{}", d.message),
        }
    }
    let errors = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("configuration has {errors} error(s); run `courier check-config`");
    }
    Ok(config)
}

#[cfg(feature = "metrics")]
fn init_metrics(config: &CourierConfig) -> anyhow::Result<courier_metrics::MetricsHandle> {
    courier_metrics::init_metrics(courier_metrics::MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config
            .metrics
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    })
}

async fn run(cli: &Cli, echo_delay: Duration) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;

    #[cfg(feature = "metrics")]
    let metrics = init_metrics(&config)?;

    let mut channels = ChannelRegistry::new();
    channels.register(Arc::new(console::ConsoleOutbound))?;

    let mut generators = GeneratorRegistry::new();
    generators.register(Arc::new(console::EchoGenerator::new(echo_delay)))?;

    let pipeline = Pipeline::new(&config, Arc::new(channels), generators);
    let dispatcher = Dispatcher::start(config.dispatch.clone(), Arc::new(pipeline));

    let stop = CancellationToken::new();
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
            }
            stop.cancel();
        })
    };

    let result = console::read_stdin(&dispatcher, stop.clone()).await;
    if result.is_ok() && !stop.is_cancelled() {
        // EOF: let queued lines finish before shutting down.
        wait_for_idle(&dispatcher, &stop, config.dispatch.idle_sweep_interval()).await;
    }

    dispatcher.shutdown().await;
    ctrl_c.abort();

    #[cfg(feature = "metrics")]
    {
        let rendered = metrics.render();
        if !rendered.is_empty() {
            tracing::debug!(metrics = %rendered, "final metrics snapshot");
        }
    }

    result
}

async fn wait_for_idle(dispatcher: &Dispatcher, stop: &CancellationToken, poll: Duration) {
    loop {
        let stats = dispatcher.stats();
        if stats.queued == 0 && stats.outstanding == 0 {
            return;
        }
        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(poll) => {},
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    match cli.command {
        Some(Commands::CheckConfig { verbose }) => {
            config_commands::check(cli.config.as_deref(), verbose)
        },
        Some(Commands::Run { echo_delay_ms }) => {
            info!(version = env!("CARGO_PKG_VERSION"), "courier starting");
            run(&cli, Duration::from_millis(echo_delay_ms)).await
        },
        None => {
            info!(version = env!("CARGO_PKG_VERSION"), "courier starting");
            run(&cli, Duration::ZERO).await
        },
    }
}
