//! chatproxy worker process.
//!
//! Reads requests on stdin, writes responses on stdout. The API key comes
//! from `CHATPROXY_API_KEY`, never from arguments. The process exits as soon
//! as the read loop stops, even while the host still holds stdin open.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use chatproxy::service::{Credentials, ServiceRegistry};
use chatproxy::worker::connections::DefaultService;
use chatproxy::worker::{WorkerConfig, run_worker};

#[derive(Parser, Debug)]
#[command(name = "chatproxy-worker", about = "Serve chatproxy commands over stdin/stdout")]
struct Args {
    /// Default service id used when create-connection names none
    #[arg(long)]
    provider: Option<String>,

    /// JSON options for the default service
    #[arg(long, requires = "provider")]
    config: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    /// Exit after this many milliseconds without a request
    #[arg(long = "idle-timeout-ms")]
    idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_path: Option<PathBuf>,
}

impl Args {
    fn log_level(&self) -> Option<&str> {
        match (&self.log_level, self.debug) {
            (Some(level), _) => Some(level.as_str()),
            (None, true) => Some("debug"),
            (None, false) => None,
        }
    }

    fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let default_service = match &self.provider {
            Some(service_id) => {
                let options = match &self.config {
                    Some(raw) => serde_json::from_str(raw).context("--config is not valid JSON")?,
                    None => serde_json::json!({}),
                };
                Some(DefaultService {
                    service_id: service_id.clone(),
                    options,
                })
            }
            None => None,
        };
        Ok(WorkerConfig::new()
            .with_idle_timeout(self.idle_timeout_ms.map(Duration::from_millis))
            .with_default_service(default_service)
            .with_credentials(Credentials::from_env()))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    chatproxy::logging::init_tracing(args.log_level(), args.log_path.as_deref())
        .context("failed to open log file")?;

    let config = args.worker_config()?;
    let registry = ServiceRegistry::with_builtin();
    if let Some(default) = &config.default_service
        && !registry.contains(&default.service_id)
    {
        anyhow::bail!("unknown provider: {}", default.service_id);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let exit = runtime.block_on(run_worker(config, registry));
    // Stdin is read on a blocking thread that only returns once the host
    // closes the pipe. Waiting for it would keep an idle worker alive.
    runtime.shutdown_background();

    let exit = exit?;
    tracing::debug!(?exit, "Worker done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_argument_set() {
        let args = Args::try_parse_from([
            "chatproxy-worker",
            "--provider",
            "echo",
            "--config",
            r#"{"model":"m"}"#,
            "--idle-timeout-ms",
            "1500",
            "--log-path",
            "/tmp/w.log",
        ])
        .unwrap();
        let config = args.worker_config().unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(1500)));
        let default = config.default_service.unwrap();
        assert_eq!(default.service_id, "echo");
        assert_eq!(default.options, serde_json::json!({"model": "m"}));
        assert_eq!(args.log_path, Some(PathBuf::from("/tmp/w.log")));
    }

    #[test]
    fn debug_flag_implies_debug_level() {
        let args = Args::try_parse_from(["chatproxy-worker", "--debug"]).unwrap();
        assert_eq!(args.log_level(), Some("debug"));
        let args = Args::try_parse_from(["chatproxy-worker", "--debug", "--log-level", "warn"]).unwrap();
        assert_eq!(args.log_level(), Some("warn"));
    }

    #[test]
    fn config_requires_provider() {
        assert!(Args::try_parse_from(["chatproxy-worker", "--config", "{}"]).is_err());
    }

    #[test]
    fn invalid_config_json_is_rejected() {
        let args = Args::try_parse_from(["chatproxy-worker", "--provider", "echo", "--config", "{"]).unwrap();
        assert!(args.worker_config().is_err());
    }
}
