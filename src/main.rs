//! graceful-drain - demo server with graceful shutdown
//!
//! Usage:
//!     graceful-drain --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use hyper::{Request, Response};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use graceful_drain::config::{Config, load_config};
use graceful_drain::metrics::{MetricsCollector, MetricsServer};
use graceful_drain::server::{Body, GracefulServer, Handler, ServerOptions, body};
use graceful_drain::util::init_logging;

/// Serve HTTP or FastCGI and drain in-flight requests on shutdown.
#[derive(Parser, Debug)]
#[command(name = "graceful-drain")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // Determine log level (CLI overrides config)
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Bind: {} ({:?})", config.server.bind, config.server.mode);
        println!("  TLS: {}", config.server.tls.is_some());
        println!(
            "  Signals: {}",
            config
                .server
                .signals
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        bind = %config.server.bind,
        mode = ?config.server.mode,
        tls = config.server.tls.is_some(),
        "graceful-drain starting"
    );

    run(config)
}

/// Run the server with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

async fn run_async(config: Config) -> Result<()> {
    let collector = MetricsCollector::new();

    let server = GracefulServer::with_options(
        demo_handler(
            Bytes::from(config.server.response.clone()),
            config.server.response_delay,
        ),
        ServerOptions {
            settings: config.server.settings(),
            listener: None,
            observer: Some(Arc::new(collector.clone())),
        },
    );
    server
        .close_on_interrupt(&config.server.signals)
        .context("failed to install signal handlers")?;

    let metrics = config.global.metrics.enabled.then(|| {
        let metrics = Arc::new(MetricsServer::new(
            config.global.metrics.address.to_string(),
            config.global.metrics.path.clone(),
            collector,
        ));
        let task = {
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                if let Err(e) = metrics.run().await {
                    error!(error = %e, "metrics server failed");
                }
            })
        };
        (metrics, task)
    });

    let mut serving = {
        let server = server.clone();
        let tls = config.server.tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(tls) => server.listen_and_serve_tls(&tls.cert, &tls.key).await,
                None => server.listen_and_serve().await,
            }
        })
    };

    info!("graceful-drain is running");
    info!("press Ctrl+C to stop");

    let result = tokio::select! {
        // Serving ended without a shutdown request, typically a bind failure.
        joined = &mut serving => Some(joined),
        _ = server.shutting_down() => None,
    };

    let result = match result {
        Some(joined) => joined.context("serve task panicked")?,
        None if wait_for_drain(&server, config.server.shutdown_timeout).await => {
            serving.await.context("serve task panicked")?
        }
        None => Ok(()),
    };

    if let Some((metrics, task)) = metrics {
        metrics.server().close();
        if let Err(e) = task.await {
            warn!(error = %e, "metrics task ended abnormally");
        }
    }

    result.context("server failed")?;
    info!(
        signal = server.signal_received().map(|s| s.as_str()),
        "graceful-drain shut down complete"
    );
    Ok(())
}

/// Wait for `server` to drain, giving up after `limit`. Returns whether it
/// drained.
async fn wait_for_drain(server: &GracefulServer, limit: Option<Duration>) -> bool {
    let Some(limit) = limit else {
        server.drained().await;
        return true;
    };

    if tokio::time::timeout(limit, server.drained()).await.is_ok() {
        return true;
    }

    let remaining = server.connection_states();
    warn!(
        timeout = %humantime::format_duration(limit),
        outstanding = server.outstanding(),
        connections = remaining.len(),
        "shutdown timeout elapsed, abandoning in-flight work"
    );
    for conn in remaining {
        warn!(
            conn = conn.info.id,
            peer = %conn.info.peer,
            state = %conn.state,
            protected = conn.protected,
            "connection left open"
        );
    }
    false
}

/// Answer every request with `response` after `delay`.
fn demo_handler(response: Bytes, delay: Duration) -> impl Handler {
    move |_req: Request<Body>| {
        let response = response.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Response::new(body::full(response))
        }
    }
}
