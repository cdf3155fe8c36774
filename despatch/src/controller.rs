use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use despatch_common::{Shutdown, Signal, internal, logging};
use despatch_delivery::{DeliveryConfig, DeliveryProcessor};
use despatch_queue::{Queue, QueueConfig};
use ron::{Options, extensions::Extensions};
use serde::Deserialize;
use tokio::sync::broadcast;

/// How long the delivery processor gets to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub const CONFIG_ENV: &str = "DESPATCH_CONFIG";

const DEFAULT_CONFIG_PATHS: [&str; 2] = [
    "./despatch.config.ron",
    "/etc/despatch/despatch.config.ron",
];

/// Top level of `despatch.config.ron`.
///
/// ```ron
/// #![enable(implicit_some)]
/// (
///     queue: File(path: "/var/spool/despatch"),
///     delivery: (
///         domain: "mail.example.org",
///         timeouts: (command_secs: 300),
///     ),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Despatch {
    #[serde(default)]
    queue: QueueConfig,
    delivery: DeliveryConfig,
}

impl Despatch {
    /// Parse a configuration document. `Option` fields may be written without
    /// `Some(..)`.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not a valid configuration.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .from_str(content)?)
    }

    /// Read and parse the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    #[must_use]
    pub const fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    #[must_use]
    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// Open the configured queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue backend cannot be initialised.
    pub fn open_queue(&self) -> anyhow::Result<Arc<dyn Queue>> {
        Ok(self.queue.clone().into_queue()?)
    }

    /// Run the delivery engine until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// This function will return an error if the queue or the delivery
    /// processor fail to initialise, or signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        internal!("Controller running");

        let queue = self.open_queue()?;
        let processor = DeliveryProcessor::init(self.delivery, queue).await?;

        let (sender, receiver) = broadcast::channel(1);
        let mut delivery = tokio::spawn(processor.serve(Shutdown::new(receiver)));

        tokio::select! {
            joined = &mut delivery => {
                joined?;
                internal!(level = WARN, "Delivery processor stopped on its own");
                return Ok(());
            }
            signalled = wait_for_signal() => signalled?,
        }

        if sender.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "Delivery processor already gone");
        }

        tokio::select! {
            joined = tokio::time::timeout(SHUTDOWN_GRACE, &mut delivery) => match joined {
                Ok(joined) => joined?,
                Err(_) => {
                    internal!(
                        level = WARN,
                        "Delivery processor still busy after {}s, abandoning it",
                        SHUTDOWN_GRACE.as_secs()
                    );
                    delivery.abort();
                }
            },
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown");
                delivery.abort();
            }
        }

        internal!("Shutting down...");

        Ok(())
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    }

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `explicit`, normally from `--config`
/// 2. `DESPATCH_CONFIG` environment variable
/// 3. ./despatch.config.ron (current working directory)
/// 4. /etc/despatch/despatch.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if an explicitly named file does not exist, or nothing
/// was found.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    locate(
        explicit,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &DEFAULT_CONFIG_PATHS.map(PathBuf::from),
    )
}

fn locate(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "--config points to non-existent file: {}", path.display());
        return Ok(path.to_path_buf());
    }

    if let Some(path) = from_env {
        anyhow::ensure!(
            path.exists(),
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
        return Ok(path);
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Despatch::from_ron(
            r#"(
                queue: Memory,
                delivery: (domain: "mail.example.org"),
            )"#,
        )
        .unwrap();

        assert!(matches!(config.queue(), QueueConfig::Memory));
        assert_eq!(config.delivery().domain, "mail.example.org");
        assert_eq!(config.delivery().idle_delay(), Duration::from_secs(30));
        assert!(config.delivery().relays.is_empty());
        assert_eq!(config.delivery().timeouts.command(), None);
    }

    #[test]
    fn test_queue_defaults_to_file_spool() {
        let config = Despatch::from_ron(r#"(delivery: (domain: "mail.example.org"))"#).unwrap();
        assert!(matches!(config.queue(), QueueConfig::File { .. }));
    }

    #[test]
    fn test_queue_key_has_no_alias() {
        let config =
            Despatch::from_ron(r#"(spool: Memory, delivery: (domain: "mail.example.org"))"#)
                .unwrap();
        assert!(matches!(config.queue(), QueueConfig::File { .. }));
    }

    #[test]
    fn test_options_without_some() {
        let config = Despatch::from_ron(
            r#"(
                queue: File(path: "/var/spool/despatch-test"),
                delivery: (
                    domain: "mail.example.org",
                    relays: [(name: "example.net", relay_host: "smarthost", port: 2525)],
                    timeouts: (connect_secs: 10, command_secs: 300),
                ),
            )"#,
        )
        .unwrap();

        let delivery = config.delivery();
        assert_eq!(delivery.relays[0].port(), 2525);
        assert_eq!(delivery.timeouts.connect(), Some(Duration::from_secs(10)));
        assert_eq!(delivery.timeouts.command(), Some(Duration::from_secs(300)));
        assert_eq!(delivery.timeouts.data(), None);
    }

    #[test]
    fn test_missing_domain_is_rejected() {
        assert!(Despatch::from_ron("(queue: Memory, delivery: ())").is_err());
    }

    #[test]
    fn test_locate_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.ron");
        let from_env = dir.path().join("env.ron");
        let default = dir.path().join("default.ron");
        for path in [&explicit, &from_env, &default] {
            std::fs::write(path, "()").unwrap();
        }
        let defaults = vec![dir.path().join("absent.ron"), default.clone()];

        assert_eq!(
            locate(Some(explicit.as_path()), Some(from_env.clone()), &defaults).unwrap(),
            explicit
        );
        assert_eq!(
            locate(None, Some(from_env.clone()), &defaults).unwrap(),
            from_env
        );
        assert_eq!(locate(None, None, &defaults).unwrap(), default);
    }

    #[test]
    fn test_locate_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.ron");

        assert!(locate(Some(absent.as_path()), None, &[]).is_err());
        assert!(locate(None, Some(absent.clone()), &[]).is_err());

        let err = locate(None, None, std::slice::from_ref(&absent)).unwrap_err();
        assert!(err.to_string().contains("absent.ron"));
    }
}
