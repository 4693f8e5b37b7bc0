//! Worker spawn strategies.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::fault::Fault;
use crate::service::{API_KEY_ENV, Credentials, ServiceRegistry};
use crate::worker::connections::DefaultService;
use crate::worker::{WorkerConfig, serve};

/// Fixed parameters passed to every worker launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchParams {
    pub idle_timeout: Option<Duration>,
    pub log_level: Option<String>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

impl From<SpawnError> for Fault {
    fn from(e: SpawnError) -> Self {
        Fault::process(format!("failed to start worker: {e}"))
    }
}

/// A running worker as seen from the host.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Non-blocking liveness check.
    fn has_exited(&mut self) -> bool;

    /// Wait until the worker has stopped.
    async fn wait(&mut self);

    /// Stop the worker without waiting.
    fn kill(&mut self);
}

pub struct SpawnedWorker {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn WorkerHandle>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, params: &LaunchParams) -> Result<SpawnedWorker, SpawnError>;
}

/// Launches the worker executable as a child process.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    api_key: Option<String>,
    default_service: Option<DefaultService>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            api_key: None,
            default_service: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Forwarded through the environment, never on the command line.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_default_service(mut self, service_id: impl Into<String>, options: serde_json::Value) -> Self {
        self.default_service = Some(DefaultService {
            service_id: service_id.into(),
            options,
        });
        self
    }

    /// Command-line arguments for one launch.
    pub fn command_args(&self, params: &LaunchParams) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(default) = &self.default_service {
            args.push("--provider".to_string());
            args.push(default.service_id.clone());
            args.push("--config".to_string());
            args.push(default.options.to_string());
        }
        if let Some(timeout) = params.idle_timeout {
            args.push("--idle-timeout-ms".to_string());
            args.push(timeout.as_millis().to_string());
        }
        if let Some(level) = &params.log_level {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        if let Some(path) = &params.log_path {
            args.push("--log-path".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, params: &LaunchParams) -> Result<SpawnedWorker, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.command_args(params))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        match &self.api_key {
            Some(key) => command.env(API_KEY_ENV, key),
            None => command.env_remove(API_KEY_ENV),
        };

        let mut child = command.spawn()?;
        tracing::debug!(program = %self.program.display(), pid = ?child.id(), "Worker process spawned");
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("worker stdout not piped".to_string()))?;
        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: Box::new(ChildHandle(child)),
        })
    }
}

struct ChildHandle(Child);

#[async_trait]
impl WorkerHandle for ChildHandle {
    fn has_exited(&mut self) -> bool {
        !matches!(self.0.try_wait(), Ok(None))
    }

    async fn wait(&mut self) {
        match self.0.wait().await {
            Ok(status) => tracing::debug!(%status, "Worker process exited"),
            Err(e) => tracing::warn!(error = %e, "Failed to wait for worker process"),
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.0.start_kill() {
            tracing::debug!(error = %e, "Worker process already gone");
        }
    }
}

/// Runs the worker loop on a tokio task over in-memory pipes.
///
/// Log level and path are ignored: the task logs through the host's
/// subscriber.
pub struct InProcessSpawner {
    registry: ServiceRegistry,
    config: WorkerConfig,
    spawned: AtomicUsize,
}

impl InProcessSpawner {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            config: WorkerConfig::default(),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    /// Number of workers started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

const PIPE_CAPACITY: usize = 256 * 1024;

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, params: &LaunchParams) -> Result<SpawnedWorker, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Other(format!("no tokio runtime: {e}")))?;

        let (host_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, host_stdout) = tokio::io::duplex(PIPE_CAPACITY);

        let mut config = self.config.clone();
        if params.idle_timeout.is_some() {
            config.idle_timeout = params.idle_timeout;
        }
        let registry = self.registry.clone();
        let task = runtime.spawn(async move {
            match serve(config, registry, worker_stdin, worker_stdout).await {
                Ok(exit) => tracing::debug!(?exit, "In-process worker exited"),
                Err(e) => tracing::error!(error = %e, "In-process worker failed"),
            }
        });
        self.spawned.fetch_add(1, Ordering::SeqCst);

        Ok(SpawnedWorker {
            stdin: Box::new(host_stdin),
            stdout: Box::new(host_stdout),
            handle: Box::new(TaskHandle(task)),
        })
    }
}

struct TaskHandle(JoinHandle<()>);

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn has_exited(&mut self) -> bool {
        self.0.is_finished()
    }

    async fn wait(&mut self) {
        if let Err(e) = (&mut self.0).await
            && e.is_panic()
        {
            tracing::error!(error = %e, "In-process worker panicked");
        }
    }

    fn kill(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_args_carry_launch_params() {
        let spawner = ProcessSpawner::new("chatproxy-worker")
            .with_api_key("sk-secret")
            .with_default_service("echo", json!({"model": "m"}));
        let params = LaunchParams {
            idle_timeout: Some(Duration::from_secs(90)),
            log_level: Some("debug".to_string()),
            log_path: Some(PathBuf::from("/tmp/worker.log")),
        };
        let args = spawner.command_args(&params);
        assert_eq!(
            args,
            vec![
                "--provider",
                "echo",
                "--config",
                r#"{"model":"m"}"#,
                "--idle-timeout-ms",
                "90000",
                "--log-level",
                "debug",
                "--log-path",
                "/tmp/worker.log",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("sk-secret")));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _guard = rt.enter();
        let err = ProcessSpawner::new("/nonexistent/chatproxy-worker")
            .spawn(&LaunchParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
        let fault: Fault = err.into();
        assert_eq!(fault.category(), "ProcessFault");
    }

    #[tokio::test]
    async fn in_process_worker_stops_on_end_of_input() {
        let spawner = InProcessSpawner::new(ServiceRegistry::with_builtin());
        let SpawnedWorker {
            stdin, mut handle, ..
        } = spawner.spawn(&LaunchParams::default()).unwrap();
        assert_eq!(spawner.spawned(), 1);
        assert!(!handle.has_exited());

        drop(stdin);
        handle.wait().await;
        assert!(handle.has_exited());
    }
}
