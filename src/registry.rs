//! Registry of running function workers
//!
//! The registry maps a function name to its worker and is the only place that
//! decides whether a worker has to be spawned. Each function owns a slot
//! (`OnceCell`) that is inserted atomically on first lookup; concurrent first
//! callers all await the same slot initialization, so at most one worker is
//! ever started per function. A failed initialization leaves the slot empty
//! and the next caller retries.

use crate::ports::PortAllocator;
use crate::supervisor::{SpawnError, Supervisor, Worker};
use crate::transform::transform;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Worker>>;

/// Owns every worker process spawned by the router.
///
/// `WorkerRegistry` is shared between request tasks behind an `Arc`; the
/// [`new`](WorkerRegistry::new) constructor returns `Arc<Self>` directly.
pub struct WorkerRegistry {
    /// Worker slots keyed by function name
    workers: DashMap<String, Slot>,
    /// Port cursor for new workers
    ports: PortAllocator,
    /// Launches and probes worker processes
    supervisor: Supervisor,
    /// Number of spawn attempts
    spawns: AtomicU64,
}

impl WorkerRegistry {
    pub fn new(ports: PortAllocator, supervisor: Supervisor) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            ports,
            supervisor,
            spawns: AtomicU64::new(0),
        })
    }

    /// Get the slot for a function, inserting an empty one if absent
    fn slot(&self, function: &str) -> Slot {
        self.workers
            .entry(function.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Return the port of the function's worker, spawning it if needed
    pub async fn ensure_worker(self: &Arc<Self>, function: &str) -> Result<u16, SpawnError> {
        let mut slot = self.slot(function);

        if let Some(worker) = slot.get() {
            if !worker.has_exited() {
                return Ok(worker.port());
            }
            warn!(
                function,
                port = worker.port(),
                pid = worker.pid(),
                uptime_secs = worker.uptime().as_secs(),
                "Worker process is gone, replacing it"
            );
            self.workers
                .remove_if(function, |_, current| Arc::ptr_eq(current, &slot));
            slot = self.slot(function);
        }

        // The slot is initialized from a detached task so that a caller
        // dropping out mid-spawn neither kills the child nor lets the next
        // waiter start a second one.
        let registry = Arc::clone(self);
        let name = function.to_string();
        let spawn = tokio::spawn(async move {
            let port = slot
                .get_or_try_init(|| registry.spawn_worker(&name))
                .await
                .map(Worker::port);
            port
        });

        spawn.await.map_err(|e| SpawnError::Task {
            function: function.to_string(),
            details: e.to_string(),
        })?
    }

    /// Read, rewrite and launch a function. The source is read before a port
    /// is taken so that a missing function never consumes one.
    async fn spawn_worker(&self, function: &str) -> Result<Worker, SpawnError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let source = self.supervisor.read_source(function).await?;
        let port = self.ports.allocate()?;
        let code = transform(&source.text, port).map_err(|source| SpawnError::Transform {
            function: function.to_string(),
            source,
        })?;
        debug!(function, port, path = %source.path.display(), "Rewrote function source");

        self.supervisor.launch(function, &code, port).await
    }

    /// Names of functions with a running worker, sorted
    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Port of the function's worker, if one is running
    pub fn port_of(&self, function: &str) -> Option<u16> {
        self.workers
            .get(function)
            .and_then(|slot| slot.get().map(Worker::port))
    }

    /// Number of spawn attempts since the router started
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Stop every worker and forget them
    pub async fn stop_all(&self) {
        let slots: Vec<Slot> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.workers.clear();

        let grace_period = self.supervisor.runtime().shutdown_grace_period();
        for slot in slots {
            if let Some(worker) = slot.get() {
                info!(function = worker.function(), port = worker.port(), "Stopping worker");
                worker.stop(grace_period).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const SOURCE: &str = "import { serve } from \"https://deno.land/std@0.168.0/http/server.ts\";\nserve(async (_req) => new Response(\"ok\"));\n";

    fn write_function(dir: &Path, name: &str, source: &str) {
        let fn_dir = dir.join(name);
        std::fs::create_dir_all(&fn_dir).unwrap();
        std::fs::write(fn_dir.join("index.ts"), source).unwrap();
    }

    fn registry(dir: &Path, base_port: u16, script: &str) -> Arc<WorkerRegistry> {
        let runtime = RuntimeConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            startup_timeout_secs: 2,
            probe_interval_ms: 20,
            shutdown_grace_period_secs: 1,
            ..RuntimeConfig::default()
        };
        WorkerRegistry::new(
            PortAllocator::new(base_port),
            Supervisor::new(runtime, dir.to_path_buf(), "127.0.0.1".to_string()),
        )
    }

    /// Bind the ports workers will be assigned, standing in for their listeners
    async fn listen_on(ports: &[u16]) -> Vec<TcpListener> {
        let mut listeners = Vec::new();
        for port in ports {
            listeners.push(TcpListener::bind(("127.0.0.1", *port)).await.unwrap());
        }
        listeners
    }

    #[test]
    fn test_empty_registry() {
        let tmp = TempDir::new().unwrap();
        let registry = registry(tmp.path(), 32000, "exit 0");

        assert!(registry.snapshot_names().is_empty());
        assert_eq!(registry.port_of("hello"), None);
        assert_eq!(registry.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let registry = registry(tmp.path(), 32010, "exit 0");

        let err = registry.ensure_worker("ghost").await.unwrap_err();
        assert!(matches!(err, SpawnError::SourceNotFound { .. }));

        assert!(registry.snapshot_names().is_empty());
        assert_eq!(registry.port_of("ghost"), None);
        // No port was consumed
        assert_eq!(registry.ports.allocated(), 0);
    }

    #[tokio::test]
    async fn test_transform_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        write_function(tmp.path(), "odd", "export default { fetch() {} }");
        let registry = registry(tmp.path(), 32020, "exit 0");

        let err = registry.ensure_worker("odd").await.unwrap_err();
        assert!(matches!(err, SpawnError::Transform { .. }));
        assert!(registry.snapshot_names().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reuse_does_not_respawn() {
        let tmp = TempDir::new().unwrap();
        write_function(tmp.path(), "hello", SOURCE);
        let _listeners = listen_on(&[32030]).await;
        let registry = registry(tmp.path(), 32030, "cat > /dev/null; exec sleep 30");

        assert_eq!(registry.ensure_worker("hello").await.unwrap(), 32030);
        assert_eq!(registry.ensure_worker("hello").await.unwrap(), 32030);
        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(registry.port_of("hello"), Some(32030));
        assert_eq!(registry.snapshot_names(), vec!["hello"]);

        registry.stop_all().await;
        assert!(registry.snapshot_names().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_spawn() {
        let tmp = TempDir::new().unwrap();
        write_function(tmp.path(), "hello", SOURCE);
        let _listeners = listen_on(&[32040]).await;
        // settle_ms keeps the spawn in flight while the other callers arrive
        let registry = {
            let runtime = RuntimeConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null; exec sleep 30".to_string()],
                probe_interval_ms: 20,
                settle_ms: 300,
                shutdown_grace_period_secs: 1,
                ..RuntimeConfig::default()
            };
            WorkerRegistry::new(
                PortAllocator::new(32040),
                Supervisor::new(runtime, tmp.path().to_path_buf(), "127.0.0.1".to_string()),
            )
        };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.ensure_worker("hello").await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 32040);
        }
        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(registry.ports.allocated(), 1);

        registry.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_first_caller_does_not_restart_spawn() {
        let tmp = TempDir::new().unwrap();
        write_function(tmp.path(), "hello", SOURCE);
        let _listeners = listen_on(&[32080, 32081]).await;
        let registry = {
            let runtime = RuntimeConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null; exec sleep 30".to_string()],
                probe_interval_ms: 20,
                settle_ms: 500,
                shutdown_grace_period_secs: 1,
                ..RuntimeConfig::default()
            };
            WorkerRegistry::new(
                PortAllocator::new(32080),
                Supervisor::new(runtime, tmp.path().to_path_buf(), "127.0.0.1".to_string()),
            )
        };

        let leader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.ensure_worker("hello").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let follower = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.ensure_worker("hello").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The client behind the first request goes away mid-spawn
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        assert_eq!(follower.await.unwrap().unwrap(), 32080);
        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(registry.ports.allocated(), 1);

        let worker_slot = registry.workers.get("hello").map(|entry| Arc::clone(entry.value())).unwrap();
        assert!(!worker_slot.get().unwrap().has_exited());

        registry.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_distinct_functions_get_increasing_ports() {
        let tmp = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            write_function(tmp.path(), name, SOURCE);
        }
        let _listeners = listen_on(&[32050, 32051, 32052]).await;
        let registry = registry(tmp.path(), 32050, "cat > /dev/null; exec sleep 30");

        let a = registry.ensure_worker("a").await.unwrap();
        let b = registry.ensure_worker("b").await.unwrap();
        let c = registry.ensure_worker("c").await.unwrap();

        assert!(a < b && b < c, "ports not increasing: {} {} {}", a, b, c);
        assert_eq!(registry.snapshot_names(), vec!["a", "b", "c"]);

        registry.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_worker_is_replaced_on_a_new_port() {
        let tmp = TempDir::new().unwrap();
        write_function(tmp.path(), "hello", SOURCE);
        let _listeners = listen_on(&[32060, 32061]).await;
        // Worker exits shortly after it was found listening
        let registry = registry(tmp.path(), 32060, "cat > /dev/null; sleep 0.3");

        assert_eq!(registry.ensure_worker("hello").await.unwrap(), 32060);
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(registry.ensure_worker("hello").await.unwrap(), 32061);
        assert_eq!(registry.spawn_count(), 2);
        assert_eq!(registry.snapshot_names(), vec!["hello"]);

        registry.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_spawn_can_be_retried() {
        let tmp = TempDir::new().unwrap();
        let _listeners = listen_on(&[32070]).await;
        let registry = registry(tmp.path(), 32070, "cat > /dev/null; exec sleep 30");

        assert!(registry.ensure_worker("late").await.is_err());

        write_function(tmp.path(), "late", SOURCE);
        assert_eq!(registry.ensure_worker("late").await.unwrap(), 32070);
        assert_eq!(registry.spawn_count(), 2);

        registry.stop_all().await;
    }
}
