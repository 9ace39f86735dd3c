//! Worker process supervision
//!
//! A worker is one runtime process executing one function. The supervisor
//! locates the function source, launches the runtime with the rewritten source
//! on stdin, and probes the assigned port until the worker accepts
//! connections. Workers are stopped only when the router shuts down or when a
//! dead worker is replaced.

use crate::config::RuntimeConfig;
use crate::ports::PortsExhausted;
use crate::transform::TransformError;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Source file names tried, in order, inside `{functions_dir}/{name}/`
pub const SOURCE_CANDIDATES: [&str; 5] = ["index.ts", "index.js", "index.tsx", "index.jsx", "index.mjs"];

/// Upper bound on a single readiness connect attempt
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no index source found for function '{function}' in {}", .dir.display())]
    SourceNotFound { function: String, dir: PathBuf },

    #[error("failed to read {} for function '{function}': {source}", .path.display())]
    ReadSource {
        function: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to prepare source for function '{function}': {source}")]
    Transform {
        function: String,
        source: TransformError,
    },

    #[error(transparent)]
    Ports(#[from] PortsExhausted),

    #[error("failed to launch '{command}' for function '{function}': {source}")]
    Launch {
        function: String,
        command: String,
        source: std::io::Error,
    },

    #[error("failed to stream source to worker for '{function}': {details}")]
    Stdin { function: String, details: String },

    #[error("worker for '{function}' exited before listening on port {port} ({status})")]
    Exited {
        function: String,
        port: u16,
        status: String,
    },

    #[error("spawn task for '{function}' failed: {details}")]
    Task { function: String, details: String },

    #[error("worker for '{function}' did not listen on port {port} within {timeout:?}")]
    StartupTimeout {
        function: String,
        port: u16,
        timeout: Duration,
    },
}

/// Function source as read from disk
#[derive(Debug, Clone)]
pub struct FunctionSource {
    pub path: PathBuf,
    pub text: String,
}

/// A running worker process bound to a dedicated port
pub struct Worker {
    function: String,
    port: u16,
    pid: Option<u32>,
    started_at: Instant,
    child: Mutex<Option<Child>>,
}

impl Worker {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the worker process is gone (exited, reaped or stopped)
    pub fn has_exited(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Stop the worker: SIGTERM, wait for the grace period, then SIGKILL
    pub async fn stop(&self, grace_period: Duration) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let function = self.function.as_str();

        if let Ok(Some(status)) = child.try_wait() {
            debug!(function, ?status, "Worker already exited");
            return;
        }

        if let Some(pid) = child.id() {
            info!(function, pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(function, ?status, "Worker exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(function, error = %e, "Error waiting for worker to exit");
            }
            Err(_) => {
                warn!(
                    function,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("function", &self.function)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Launches and probes worker processes
#[derive(Debug, Clone)]
pub struct Supervisor {
    runtime: RuntimeConfig,
    functions_dir: PathBuf,
    worker_host: String,
}

impl Supervisor {
    pub fn new(runtime: RuntimeConfig, functions_dir: PathBuf, worker_host: String) -> Self {
        Self {
            runtime,
            functions_dir,
            worker_host,
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Read `{functions_dir}/{function}/index.*`
    pub async fn read_source(&self, function: &str) -> Result<FunctionSource, SpawnError> {
        let dir = self.functions_dir.join(function);

        for candidate in SOURCE_CANDIDATES {
            let path = dir.join(candidate);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    debug!(function, path = %path.display(), bytes = text.len(), "Read function source");
                    return Ok(FunctionSource { path, text });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(SpawnError::ReadSource {
                        function: function.to_string(),
                        path,
                        source,
                    })
                }
            }
        }

        Err(SpawnError::SourceNotFound {
            function: function.to_string(),
            dir,
        })
    }

    /// Launch the runtime for `function`, feed it `code` and wait until it
    /// listens on `port`
    pub async fn launch(&self, function: &str, code: &str, port: u16) -> Result<Worker, SpawnError> {
        info!(function, port, command = %self.runtime.command, "Starting worker");

        let mut cmd = Command::new(&self.runtime.command);
        cmd.args(&self.runtime.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        for (key, value) in &self.runtime.env {
            cmd.env(key, value);
        }

        // Runtimes that honor PORT bind correctly even without the rewrite
        cmd.env("PORT", port.to_string());

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            function: function.to_string(),
            command: self.runtime.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(function, port, pid, "Worker process spawned");

        if let Err(details) = self.write_source(&mut child, code).await {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SpawnError::Exited {
                    function: function.to_string(),
                    port,
                    status: status.to_string(),
                });
            }
            let _ = child.kill().await;
            return Err(SpawnError::Stdin {
                function: function.to_string(),
                details,
            });
        }

        self.wait_until_listening(function, port, &mut child).await?;

        let settle = self.runtime.settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        info!(function, port, pid, "Worker is ready");

        Ok(Worker {
            function: function.to_string(),
            port,
            pid,
            started_at: Instant::now(),
            child: Mutex::new(Some(child)),
        })
    }

    /// Write the source to the child's stdin and close it
    async fn write_source(&self, child: &mut Child, code: &str) -> Result<(), String> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| "stdin was not captured".to_string())?;

        let timeout = self.runtime.startup_timeout();
        match tokio::time::timeout(timeout, stdin.write_all(code.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("worker did not consume its source within {:?}", timeout)),
        }

        // Dropping the handle closes the pipe so the runtime sees EOF
        drop(stdin);
        Ok(())
    }

    async fn wait_until_listening(
        &self,
        function: &str,
        port: u16,
        child: &mut Child,
    ) -> Result<(), SpawnError> {
        let timeout = self.runtime.startup_timeout();
        let interval = self.runtime.probe_interval();
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                warn!(function, port, %status, "Worker exited during startup");
                return Err(SpawnError::Exited {
                    function: function.to_string(),
                    port,
                    status: status.to_string(),
                });
            }

            attempts += 1;
            if self.probe(port).await {
                debug!(
                    function,
                    port,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Worker accepted a connection"
                );
                return Ok(());
            }

            if start.elapsed() > timeout {
                warn!(function, port, timeout_secs = timeout.as_secs(), "Worker startup timeout exceeded");
                let _ = child.kill().await;
                return Err(SpawnError::StartupTimeout {
                    function: function.to_string(),
                    port,
                    timeout,
                });
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn probe(&self, port: u16) -> bool {
        let connect = TcpStream::connect((self.worker_host.as_str(), port));
        matches!(
            tokio::time::timeout(PROBE_CONNECT_TIMEOUT, connect).await,
            Ok(Ok(_))
        )
    }
}
