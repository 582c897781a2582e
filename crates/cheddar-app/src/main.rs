//! Cheddar Proxy trust tool.
//!
//! Inspects and installs the proxy's CA certificate, toggles the OS proxy, and
//! can keep the OS proxy converged with the recording state until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cheddar_trust::{
    CertificateStatus, ProxyDesiredState, Reconciler, StaticEngine, TrustConfig, TrustService,
};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Cheddar Proxy certificate trust and system proxy tool
#[derive(Parser, Debug)]
#[command(name = "cheddar", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show whether the CA certificate is installed and trusted
    Status {
        /// Bypass the status cache
        #[arg(long)]
        force: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
        /// Certificate file (defaults to the engine's CA file)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show subject, issuer, validity and fingerprint of the CA file
    Info {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Install the CA certificate and mark it trusted
    Trust {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Remove the CA certificate from the trust store
    Remove,
    /// Inspect or change the OS HTTP/HTTPS proxy
    Proxy {
        #[command(subcommand)]
        action: ProxyCommand,
    },
    /// Keep the OS proxy in line with the recording state until Ctrl-C
    Watch {
        /// Engine port
        #[arg(long)]
        port: Option<u16>,
        /// Treat the engine as recording
        #[arg(long)]
        recording: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    /// Check whether HTTP and HTTPS point at the local proxy
    Check {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Point HTTP and HTTPS at the local proxy
    Enable {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Turn the OS proxy off
    Disable,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    platform: &'a str,
    path: &'a Path,
    status: CertificateStatus,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "cheddarproxy", "Cheddar Proxy")
        .map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging: daily rolling file plus stderr.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cheddar={level},cheddar_trust={level},warn",
            level = log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("cheddar")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Loads the configuration file, or defaults when none is given.
fn load_config(path: Option<&Path>) -> anyhow::Result<TrustConfig> {
    let Some(path) = path else {
        return Ok(TrustConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

async fn print_status(
    service: &TrustService,
    path: Option<PathBuf>,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| service.default_certificate_path());
    let status = service.certificate_status(&path, force).await;

    if json {
        let report = StatusReport {
            platform: service.platform().as_str(),
            path: &path,
            status,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} ({})", status, path.display());
    }
    Ok(())
}

async fn print_info(
    service: &TrustService,
    path: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| service.default_certificate_path());
    let info = service
        .certificate_info(&path)
        .await
        .with_context(|| format!("could not read certificate details from {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Subject:     {}", info.subject);
        println!("Issuer:      {}", info.issuer);
        println!("Not before:  {}", info.not_before);
        println!("Not after:   {}", info.not_after);
        println!("SHA-256:     {}", info.fingerprint);
    }
    Ok(())
}

async fn watch(service: TrustService, port: u16, recording: bool) -> anyhow::Result<()> {
    let service = Arc::new(service);
    let engine = Arc::new(StaticEngine::new(
        service.config().proxy_host_name().to_string(),
        port,
        recording,
    ));
    let desired = ProxyDesiredState {
        should_be_recording: recording,
        port,
    };
    let reconciler = Arc::new(Reconciler::new(service.clone(), engine, desired));
    let mut events = reconciler.subscribe();
    let handle = reconciler.clone().spawn();

    tracing::info!(port, recording, "Watching trust and proxy state (Ctrl-C to stop)");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(snapshot) => println!("{}", serde_json::to_string(&snapshot)?),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} state updates", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.stop().await;
    if !service.disable_system_proxy().await {
        tracing::warn!("System proxy may still be enabled");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let config = load_config(args.config.as_deref())?;
    let default_port = config.proxy_port;
    let service = TrustService::new(config);

    tracing::debug!(platform = %service.platform(), "Starting cheddar");
    if !service.platform().is_supported() {
        tracing::warn!("No trust store or proxy integration on this platform");
    }

    match args.command {
        Command::Status { force, json, path } => print_status(&service, path, force, json).await?,
        Command::Info { json, path } => print_info(&service, path, json).await?,
        Command::Trust { path } => {
            let path = path.unwrap_or_else(|| service.default_certificate_path());
            if service.trust_and_import_certificate(&path).await {
                println!("CA certificate trusted");
            } else {
                anyhow::bail!(
                    "CA certificate at {} is not trusted; finish trusting it in the certificate viewer",
                    path.display()
                );
            }
        }
        Command::Remove => {
            if !service.remove_existing_certificate().await {
                anyhow::bail!("failed to remove the CA certificate");
            }
            println!("CA certificate removed");
        }
        Command::Proxy { action } => match action {
            ProxyCommand::Check { port } => {
                let port = port.unwrap_or(default_port);
                let configured = service.is_proxy_configured(port).await;
                println!(
                    "System proxy {} {}:{}",
                    if configured { "points at" } else { "does not point at" },
                    service.config().proxy_host_name(),
                    port
                );
            }
            ProxyCommand::Enable { port } => {
                let port = port.unwrap_or(default_port);
                if !service.enable_system_proxy(port).await {
                    anyhow::bail!("failed to enable the system proxy on port {}", port);
                }
                println!("System proxy enabled on port {}", port);
            }
            ProxyCommand::Disable => {
                if !service.disable_system_proxy().await {
                    anyhow::bail!("failed to disable the system proxy");
                }
                println!("System proxy disabled");
            }
        },
        Command::Watch { port, recording } => {
            watch(service, port.unwrap_or(default_port), recording).await?
        }
    }

    Ok(())
}
