//! Secure Data Connector agent binary.
//!
//! Dials the tunnel server, keeps a session alive with reconnect backoff,
//! and maps terminal failures onto the operational exit codes:
//! 0 normal shutdown, 1 configuration error, 2 authorization failure,
//! 3 registration failure, 4 transport failure after the reconnect budget.

use std::error::Error as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sdc_agent::error::exit_code;
use sdc_agent::{AgentError, LocalConf, Session};
use sdc_connection::{Connector, ReconnectPolicy, ReconnectState, TlsConnector, TlsSettings};

/// Secure Data Connector agent - exposes intranet resources to a cloud
/// tunnel server over one outbound TLS connection.
#[derive(Parser, Debug)]
#[command(name = "sdc-agent")]
#[command(about = "Secure Data Connector agent")]
#[command(version)]
struct Args {
    /// Agent configuration file (YAML)
    #[arg(long, short = 'c', env = "SDC_LOCAL_CONF")]
    config: PathBuf,

    /// Override the rules file path from the configuration
    #[arg(long, env = "SDC_RULES_FILE")]
    rules_file: Option<PathBuf>,

    /// Override the tunnel server address (host:port)
    #[arg(long, env = "SDC_SERVER")]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI overrides into the loaded configuration.
fn apply_overrides(conf: &mut LocalConf, args: &Args) -> Result<(), AgentError> {
    if let Some(rules_file) = &args.rules_file {
        conf.rules_file = rules_file.clone();
    }

    if let Some(server) = &args.server {
        let (host, port) = server.rsplit_once(':').ok_or_else(|| {
            AgentError::Config(format!(
                "invalid server address '{server}' (expected host:port)"
            ))
        })?;
        if host.is_empty() {
            return Err(AgentError::Config(format!(
                "invalid server address '{server}' (host cannot be empty)"
            )));
        }
        conf.server_host = host.to_string();
        conf.server_port = port.parse().map_err(|_| {
            AgentError::Config(format!("invalid port in server address '{server}'"))
        })?;
    }

    conf.validate()
}

/// Render the error's cause chain for the single failure log line.
fn cause_chain(err: &AgentError) -> String {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain.join(" <- ")
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

async fn run(args: Args) -> i32 {
    let mut conf = match LocalConf::load(&args.config) {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            return e.exit_code();
        }
    };
    if let Err(e) = apply_overrides(&mut conf, &args) {
        error!(error = %e, "invalid configuration");
        return e.exit_code();
    }
    let conf = Arc::new(conf);

    let connector: Arc<dyn Connector> = match TlsConnector::new(TlsSettings {
        server_host: conf.server_host.clone(),
        server_port: conf.server_port,
        root_ca_path: conf.root_ca_path.clone(),
        insecure_skip_verify: conf.insecure_skip_verify,
    }) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            error!(error = %e, "cannot build TLS connector");
            return exit_code::CONFIG;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    info!(
        agent_id = %conf.agent_id,
        server = %conf.server_host,
        server_port = conf.server_port,
        "agent starting"
    );

    let mut reconnect = ReconnectState::new(ReconnectPolicy {
        max_attempts: conf.max_reconnect_attempts,
        ..Default::default()
    });

    loop {
        if *shutdown_rx.borrow() {
            return exit_code::OK;
        }

        let session = Session::new(conf.clone(), connector.clone());
        let session_id = session.id();

        match session.run(shutdown_rx.clone()).await {
            Ok(()) => {
                info!(session_id = %session_id, "agent shut down");
                return exit_code::OK;
            }
            Err(e) => {
                error!(
                    session_id = %session_id,
                    kind = e.kind(),
                    error = %e,
                    cause = %cause_chain(&e),
                    "session failed"
                );

                if !e.is_recoverable() {
                    return e.exit_code();
                }
                if session.registered() {
                    reconnect.reset();
                }
                if let Err(exhausted) = reconnect.wait().await {
                    error!(error = %exhausted, "giving up");
                    return exit_code::TRANSPORT;
                }
                warn!(attempt = reconnect.attempt(), "reconnecting");
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(&args.log_level) {
        eprintln!("{e:#}");
        std::process::exit(exit_code::CONFIG);
    }

    let code = run(args).await;
    std::process::exit(code);
}
