use crate::config::AppDescriptor;
use crate::credentials::Credential;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a sub-application
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    /// No child has been spawned yet
    NotStarted,
    /// Child spawned, not yet seen accepting connections
    Starting,
    /// Child accepted connections
    Ready,
    /// Child exited; the next `ensure_started` spawns a replacement
    Crashed,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    #[error("Failed to start '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

/// A tracked child process
struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    state: AppState,
    spawned_at: Instant,
    /// Spawns for this name, including the current one
    spawns: u64,
}

impl ChildProcess {
    /// Reap the child if it has exited, updating state.
    /// Returns true while the process is still running.
    fn refresh(&mut self, name: &str) -> bool {
        if self.state == AppState::Crashed {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(app = name, pid = ?self.pid, ?status, "Child process exited");
                self.state = AppState::Crashed;
                false
            }
            Err(e) => {
                warn!(app = name, pid = ?self.pid, error = %e, "Failed to poll child process");
                self.state = AppState::Crashed;
                false
            }
        }
    }
}

/// Status information for one sub-application
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppStatus {
    pub name: String,
    pub display_name: String,
    pub port: u16,
    pub state: AppState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub spawns: u64,
}

/// Owns the process table: one child per logical application name.
///
/// # Usage
///
/// `Supervisor` is shared behind an `Arc` between connection tasks.
/// [`new`](Supervisor::new) returns `Arc<Self>` directly.
///
/// The table is never exposed. `ensure_started` performs its check-then-spawn
/// while holding the map entry, so concurrent callers for the same name never
/// spawn twice.
pub struct Supervisor {
    /// Immutable descriptors keyed by logical name
    descriptors: BTreeMap<String, AppDescriptor>,
    /// Running or crashed children keyed by logical name
    processes: DashMap<String, Mutex<ChildProcess>>,
    /// Credential exported into every child's environment
    credential: Option<Credential>,
    /// Total spawns since startup
    spawns: AtomicU64,
    /// Set once `stop_all` begins; no spawns afterwards
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(descriptors: Vec<AppDescriptor>, credential: Option<Credential>) -> Arc<Self> {
        Arc::new(Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            processes: DashMap::new(),
            credential,
            spawns: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    /// Look up a descriptor by logical name
    pub fn descriptor(&self, name: &str) -> Option<&AppDescriptor> {
        self.descriptors.get(name)
    }

    /// All descriptors in name order
    pub fn descriptors(&self) -> impl Iterator<Item = &AppDescriptor> {
        self.descriptors.values()
    }

    /// Total number of children spawned since startup
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Make sure a live child exists for `name`.
    ///
    /// Returns `Ok(true)` when a new child was spawned (cold start or crash
    /// recovery) and `Ok(false)` when one was already running.
    pub fn ensure_started(&self, name: &str) -> Result<bool, SupervisorError> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| SupervisorError::UnknownApplication(name.to_string()))?;

        let entry = self.processes.entry(name.to_string());

        // Checked under the entry lock so stop_all cannot miss a late spawn
        if self.stopping.load(Ordering::SeqCst) {
            debug!(app = name, "Refusing to start child during shutdown");
            return Err(SupervisorError::ShuttingDown);
        }

        match entry {
            Entry::Occupied(mut entry) => {
                if entry.get().lock().refresh(name) {
                    debug!(app = name, "Child already running");
                    return Ok(false);
                }
                info!(app = name, "Restarting exited child");
                let previous = entry.get().lock().spawns;
                let mut process = self.spawn_child(descriptor)?;
                process.spawns = previous + 1;
                entry.insert(Mutex::new(process));
            }
            Entry::Vacant(entry) => {
                let process = self.spawn_child(descriptor)?;
                entry.insert(Mutex::new(process));
            }
        }

        Ok(true)
    }

    /// Current lifecycle state of `name`
    pub fn status(&self, name: &str) -> Result<AppState, SupervisorError> {
        if !self.descriptors.contains_key(name) {
            return Err(SupervisorError::UnknownApplication(name.to_string()));
        }

        Ok(self
            .processes
            .get(name)
            .map(|p| {
                let mut guard = p.lock();
                guard.refresh(name);
                guard.state
            })
            .unwrap_or(AppState::NotStarted))
    }

    /// Record that the child answered a readiness probe.
    /// Returns true on a `Starting -> Ready` transition.
    pub fn mark_ready(&self, name: &str) -> bool {
        if let Some(process) = self.processes.get(name) {
            let mut guard = process.lock();
            if guard.state == AppState::Starting && guard.refresh(name) {
                guard.state = AppState::Ready;
                info!(
                    app = name,
                    startup_ms = guard.spawned_at.elapsed().as_millis() as u64,
                    "Child is now ready"
                );
                return true;
            }
        }
        false
    }

    /// Snapshot of every configured application
    pub fn list(&self) -> Vec<AppStatus> {
        self.descriptors
            .values()
            .map(|desc| {
                let (state, pid, uptime_secs, spawns) = self
                    .processes
                    .get(&desc.name)
                    .map(|p| {
                        let mut guard = p.lock();
                        let alive = guard.refresh(&desc.name);
                        let uptime = alive.then(|| guard.spawned_at.elapsed().as_secs());
                        (guard.state, guard.pid.filter(|_| alive), uptime, guard.spawns)
                    })
                    .unwrap_or((AppState::NotStarted, None, None, 0));

                AppStatus {
                    name: desc.name.clone(),
                    display_name: desc.display_name.clone(),
                    port: desc.port,
                    state,
                    pid,
                    uptime_secs,
                    spawns,
                }
            })
            .collect()
    }

    fn spawn_child(&self, descriptor: &AppDescriptor) -> Result<ChildProcess, SupervisorError> {
        let name = descriptor.name.as_str();
        let spawn_failed = |reason: String| {
            error!(app = name, port = descriptor.port, reason = %reason, "Failed to start child");
            SupervisorError::SpawnFailed {
                name: name.to_string(),
                reason,
            }
        };

        // A foreign listener on the port would make the child fail to bind
        if let Err(e) = std::net::TcpListener::bind(("127.0.0.1", descriptor.port)) {
            return Err(spawn_failed(format!("port {} unavailable: {}", descriptor.port, e)));
        }

        let args = descriptor.child_args();
        info!(app = name, command = %descriptor.command, ?args, port = descriptor.port, "Starting child");

        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = descriptor.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        if let Some(ref credential) = self.credential {
            cmd.env(credential.env_var(), credential.value());
        }

        let child = cmd
            .spawn()
            .map_err(|e| spawn_failed(format!("{}: {}", descriptor.command, e)))?;

        let pid = child.id();
        let total = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        info!(app = name, pid = ?pid, total_spawns = total, "Child process spawned");

        Ok(ChildProcess {
            child,
            pid,
            state: AppState::Starting,
            spawned_at: Instant::now(),
            spawns: 1,
        })
    }

    /// Stop one child: SIGTERM, wait for the grace period, then SIGKILL
    pub async fn stop(&self, name: &str) {
        let Some((_, process)) = self.processes.remove(name) else {
            return;
        };
        let mut process = process.into_inner();

        let grace_period = self
            .descriptor(name)
            .map(|d| d.shutdown_grace_period)
            .unwrap_or(Duration::from_secs(5));

        if !process.refresh(name) {
            return;
        }

        if let Some(pid) = process.pid {
            info!(app = name, pid, "Sending SIGTERM to child");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = process.child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(app = name, ?status, "Child exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(app = name, error = %e, "Error waiting for child to exit");
            }
            Err(_) => {
                warn!(
                    app = name,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = process.child.kill().await;
            }
        }
    }

    /// Stop every child. Only called on shutdown; later `ensure_started`
    /// calls fail with [`SupervisorError::ShuttingDown`].
    pub async fn stop_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop(&name).await;
        }
    }
}
