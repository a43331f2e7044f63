//! # fanout
//!
//! Fanout server binary: loads settings, wires the hub (or pool of hubs)
//! into the HTTP/WebSocket server and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_core::logging::{LogFormat, init_subscriber};
use fanout_server::FanoutServer;
use fanout_settings::FanoutSettings;

/// Fanout realtime server.
#[derive(Parser, Debug)]
#[command(name = "fanout", about = "Realtime connection pool and broadcast server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Run a pool of this many local instances instead of a single hub.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Settings file (defaults to `~/.fanout/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log output format: `compact` or `json` (overrides settings).
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut FanoutSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(size) = self.pool_size {
            settings.pool.enabled = true;
            settings.pool.initial_instances = size;
            settings.pool.max_instances = settings.pool.max_instances.max(size);
        }
        if let Some(ref format) = self.log_format {
            settings.logging.format.clone_from(format);
        }
    }
}

fn load(cli: &Cli) -> Result<FanoutSettings> {
    let mut settings = match cli.settings {
        Some(ref path) => fanout_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => fanout_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings
        .validate()
        .context("Invalid settings after command-line overrides")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let format = LogFormat::parse(&settings.logging.format).unwrap_or_default();
    init_subscriber(&settings.logging.level, format);

    let metrics_handle = fanout_server::metrics::install_recorder();
    let server = Arc::new(
        FanoutServer::new(settings, metrics_handle).context("Failed to build server")?,
    );

    let mut handles = server.start();
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    handles.push(handle);

    tracing::info!(
        %addr,
        mode = ?server.service().mode(),
        "fanout listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.drain(handles).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_server::ServiceMode;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["fanout"]);
        let mut settings = FanoutSettings::default();
        cli.apply(&mut settings);
        let defaults = FanoutSettings::default();
        assert_eq!(settings.server.host, defaults.server.host);
        assert_eq!(settings.server.port, defaults.server.port);
        assert!(!settings.pool.enabled);
    }

    #[test]
    fn cli_overrides_host_and_port() {
        let cli = Cli::parse_from(["fanout", "--host", "127.0.0.1", "--port", "0"]);
        let mut settings = FanoutSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
    }

    #[test]
    fn pool_size_enables_pool() {
        let cli = Cli::parse_from(["fanout", "--pool-size", "3"]);
        let mut settings = FanoutSettings::default();
        settings.pool.max_instances = 2;
        cli.apply(&mut settings);
        assert!(settings.pool.enabled);
        assert_eq!(settings.pool.initial_instances, 3);
        assert_eq!(settings.pool.max_instances, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn load_reads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7001}}"#).unwrap();

        let cli = Cli::parse_from(["fanout", "--settings", path.to_str().unwrap()]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 7001);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let cli = Cli::parse_from(["fanout", "--settings", path.to_str().unwrap()]);
        let err = load(&cli).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[tokio::test]
    async fn server_graceful_shutdown() {
        let cli = Cli::parse_from(["fanout", "--host", "127.0.0.1", "--port", "0", "--pool-size", "2"]);
        let mut settings = FanoutSettings::default();
        cli.apply(&mut settings);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = FanoutServer::new(settings, handle).unwrap();
        assert_eq!(server.service().mode(), ServiceMode::Pooled);

        let mut handles = server.start();
        let (_, listener) = server.listen().await.unwrap();
        handles.push(listener);

        tokio::time::timeout(std::time::Duration::from_secs(5), server.drain(handles))
            .await
            .expect("shutdown timed out");
    }
}
