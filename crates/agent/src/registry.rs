//! Registry of long-lived FUSE helper processes, one per mounted S3
//! target on this host.
//!
//! Memory is the fast index; the PID file under `<pid_dir>` is the
//! durable replica that survives agent restarts. Every mutating
//! operation writes both before returning. The helper is spawned
//! detached, so the mount outlives the agent; ownership across restarts
//! is PID file + signal, not the POSIX parent/child relationship.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::mountinfo;

const DEFAULT_READY_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_TERM_WAIT: Duration = Duration::from_secs(10);
const LIVENESS_POLL: Duration = Duration::from_millis(200);

/// How a record entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Spawned,
    LoadedFromDisk,
}

/// One tracked FUSE helper.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub target_id: String,
    pub pid: i32,
    /// Unknown for records adopted from disk after a restart.
    pub mount_path: Option<PathBuf>,
    pub started_at: OffsetDateTime,
    pub env_keys: Vec<String>,
    pub source: RecordSource,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to spawn FUSE helper for {0}: {1}")]
    Spawn(String, #[source] io::Error),

    #[error("mount at {0} did not become ready within {1:?}")]
    ReadyTimeout(PathBuf, Duration),

    #[error("pid file I/O error at {0}: {1}")]
    PidFile(PathBuf, #[source] io::Error),

    #[error("failed to read mount table: {0}")]
    MountTable(#[source] io::Error),

    #[error("failed to signal pid {0}: {1}")]
    Signal(i32, Errno),
}

pub struct ProcessRegistry {
    pid_dir: PathBuf,
    fuse_binary: PathBuf,
    ready_deadline: Duration,
    term_wait: Duration,
    memory: RwLock<HashMap<String, ProcessRecord>>,
    spawn_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessRegistry {
    pub fn new(pid_dir: impl Into<PathBuf>, fuse_binary: impl Into<PathBuf>) -> Self {
        Self {
            pid_dir: pid_dir.into(),
            fuse_binary: fuse_binary.into(),
            ready_deadline: DEFAULT_READY_DEADLINE,
            term_wait: DEFAULT_TERM_WAIT,
            memory: RwLock::new(HashMap::new()),
            spawn_guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, ready_deadline: Duration, term_wait: Duration) -> Self {
        self.ready_deadline = ready_deadline;
        self.term_wait = term_wait;
        self
    }

    /// Ensure a FUSE helper is running for the target. Idempotent: a live
    /// helper, found in memory or through its PID file, short-circuits to
    /// ok. Concurrent spawns for one target serialize on a per-target
    /// guard; the loser observes the winner's record.
    pub async fn spawn(
        &self,
        target_id: &str,
        mount_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), RegistryError> {
        let guard = self.spawn_guard(target_id).await;
        let _guard = guard.lock().await;

        if let Some(record) = self.memory.read().await.get(target_id) {
            if pid_alive(record.pid) {
                tracing::debug!(target_id, pid = record.pid, "helper already tracked and alive");
                return Ok(());
            }
        }
        // Stale memory entry, if any, is purged below by the disk check.
        self.memory.write().await.remove(target_id);

        let pid_path = self.pid_path(target_id);
        if let Some(pid) = self.read_pid_file(target_id)? {
            if pid_alive(pid) {
                tracing::info!(target_id, pid, "adopting live helper from pid file");
                self.memory.write().await.insert(
                    target_id.to_string(),
                    ProcessRecord {
                        target_id: target_id.to_string(),
                        pid,
                        mount_path: Some(mount_path.to_path_buf()),
                        started_at: OffsetDateTime::now_utc(),
                        env_keys: env.keys().cloned().collect(),
                        source: RecordSource::LoadedFromDisk,
                    },
                );
                return Ok(());
            }

            tracing::warn!(target_id, pid, "removing stale pid file");
            self.delete_pid_file(target_id)?;
        }

        std::fs::create_dir_all(&self.pid_dir)
            .map_err(|e| RegistryError::PidFile(self.pid_dir.clone(), e))?;

        let mut command = Command::new(&self.fuse_binary);
        command
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group: the helper must survive the agent and
            // never receive the agent's terminal signals.
            .process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| RegistryError::Spawn(target_id.to_string(), e))?;
        let pid = child.id() as i32;

        tracing::info!(target_id, pid, mount_path = %mount_path.display(), "spawned FUSE helper");

        let ready = mountinfo::wait_for_mount(mount_path, self.ready_deadline)
            .await
            .map_err(RegistryError::MountTable)?;

        if !ready {
            tracing::error!(target_id, pid, "helper never reported the path mounted; killing it");
            let _ = child.kill();
            let _ = child.wait();
            let _ = std::fs::remove_file(&pid_path);
            return Err(RegistryError::ReadyTimeout(
                mount_path.to_path_buf(),
                self.ready_deadline,
            ));
        }

        self.write_pid_file(target_id, pid)?;
        self.memory.write().await.insert(
            target_id.to_string(),
            ProcessRecord {
                target_id: target_id.to_string(),
                pid,
                mount_path: Some(mount_path.to_path_buf()),
                started_at: OffsetDateTime::now_utc(),
                env_keys: env.keys().cloned().collect(),
                source: RecordSource::Spawned,
            },
        );

        // Reap the child when it eventually exits. The thread dies with
        // the agent; an orphaned helper is reparented and reaped by init.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(())
    }

    /// Stop the helper for a target. SIGTERM with a bounded wait, then
    /// SIGKILL. The PID file goes away with the process. Killing an
    /// untracked or already-dead target is ok.
    pub async fn kill(&self, target_id: &str, force: bool) -> Result<(), RegistryError> {
        let pid = match self.resolve_pid(target_id).await {
            Some(pid) => pid,
            None => {
                self.delete_pid_file(target_id)?;
                self.memory.write().await.remove(target_id);
                return Ok(());
            }
        };

        let signal_to_send = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match signal::kill(Pid::from_raw(pid), signal_to_send) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(RegistryError::Signal(pid, e)),
        }

        if !force {
            let deadline = tokio::time::Instant::now() + self.term_wait;
            while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(LIVENESS_POLL).await;
            }

            if pid_alive(pid) {
                tracing::warn!(target_id, pid, "helper ignored SIGTERM; sending SIGKILL");
                match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(RegistryError::Signal(pid, e)),
                }
                // Brief grace for the kernel to reap.
                tokio::time::sleep(LIVENESS_POLL).await;
            }
        }

        self.delete_pid_file(target_id)?;
        self.memory.write().await.remove(target_id);

        tracing::info!(target_id, pid, "helper stopped");
        Ok(())
    }

    /// Liveness check, memory first, disk second. A live PID found on
    /// disk is hydrated into memory.
    pub async fn is_running(&self, target_id: &str) -> Result<bool, RegistryError> {
        if let Some(record) = self.memory.read().await.get(target_id) {
            if pid_alive(record.pid) {
                return Ok(true);
            }
        }

        match self.read_pid_file(target_id)? {
            Some(pid) if pid_alive(pid) => {
                self.memory.write().await.insert(
                    target_id.to_string(),
                    ProcessRecord {
                        target_id: target_id.to_string(),
                        pid,
                        mount_path: None,
                        started_at: OffsetDateTime::now_utc(),
                        env_keys: Vec::new(),
                        source: RecordSource::LoadedFromDisk,
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Startup recovery: adopt live helpers from their PID files, delete
    /// stale files. Returns the number of adopted helpers.
    pub async fn load_existing(&self) -> Result<usize, RegistryError> {
        std::fs::create_dir_all(&self.pid_dir)
            .map_err(|e| RegistryError::PidFile(self.pid_dir.clone(), e))?;

        let entries = std::fs::read_dir(&self.pid_dir)
            .map_err(|e| RegistryError::PidFile(self.pid_dir.clone(), e))?;

        let mut adopted = 0;
        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::PidFile(self.pid_dir.clone(), e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(target_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let Some(pid) = read_pid(&path)? else {
                tracing::warn!(path = %path.display(), "removing unparseable pid file");
                std::fs::remove_file(&path)
                    .map_err(|e| RegistryError::PidFile(path.clone(), e))?;
                continue;
            };

            if pid_alive(pid) {
                tracing::info!(target_id, pid, "adopted running FUSE helper");
                self.memory.write().await.insert(
                    target_id.to_string(),
                    ProcessRecord {
                        target_id: target_id.to_string(),
                        pid,
                        mount_path: None,
                        started_at: OffsetDateTime::now_utc(),
                        env_keys: Vec::new(),
                        source: RecordSource::LoadedFromDisk,
                    },
                );
                adopted += 1;
            } else {
                tracing::info!(target_id, pid, "removing stale pid file for dead helper");
                std::fs::remove_file(&path)
                    .map_err(|e| RegistryError::PidFile(path.clone(), e))?;
            }
        }

        Ok(adopted)
    }

    /// Reconciliation: drop memory entries whose process is gone and
    /// delete their PID files. Returns how many were removed.
    pub async fn cleanup_dead(&self) -> Result<usize, RegistryError> {
        let dead: Vec<String> = {
            let memory = self.memory.read().await;
            memory
                .values()
                .filter(|record| !pid_alive(record.pid))
                .map(|record| record.target_id.clone())
                .collect()
        };

        for target_id in &dead {
            tracing::info!(target_id, "dropping dead helper from registry");
            self.delete_pid_file(target_id)?;
            self.memory.write().await.remove(target_id);
        }

        Ok(dead.len())
    }

    /// Snapshot of a tracked record, if any.
    pub async fn get(&self, target_id: &str) -> Option<ProcessRecord> {
        self.memory.read().await.get(target_id).cloned()
    }

    pub fn pid_path(&self, target_id: &str) -> PathBuf {
        self.pid_dir.join(format!("{target_id}.pid"))
    }

    async fn spawn_guard(&self, target_id: &str) -> Arc<Mutex<()>> {
        self.spawn_guards
            .lock()
            .await
            .entry(target_id.to_string())
            .or_default()
            .clone()
    }

    async fn resolve_pid(&self, target_id: &str) -> Option<i32> {
        if let Some(record) = self.memory.read().await.get(target_id) {
            if pid_alive(record.pid) {
                return Some(record.pid);
            }
        }
        match self.read_pid_file(target_id) {
            Ok(Some(pid)) if pid_alive(pid) => Some(pid),
            _ => None,
        }
    }

    fn read_pid_file(&self, target_id: &str) -> Result<Option<i32>, RegistryError> {
        read_pid(&self.pid_path(target_id))
    }

    /// Write-then-rename so a crash mid-write never leaves a torn file.
    fn write_pid_file(&self, target_id: &str, pid: i32) -> Result<(), RegistryError> {
        let path = self.pid_path(target_id);
        let tmp = self.pid_dir.join(format!(".{target_id}.pid.tmp"));

        std::fs::write(&tmp, format!("{pid}\n"))
            .map_err(|e| RegistryError::PidFile(tmp.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| RegistryError::PidFile(path, e))
    }

    fn delete_pid_file(&self, target_id: &str) -> Result<(), RegistryError> {
        let path = self.pid_path(target_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::PidFile(path, e)),
        }
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("pid_dir", &self.pid_dir)
            .field("fuse_binary", &self.fuse_binary)
            .finish()
    }
}

/// Zero-signal liveness probe. EPERM means the process exists but is not
/// ours, which still counts as alive.
fn pid_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

fn read_pid(path: &Path) -> Result<Option<i32>, RegistryError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RegistryError::PidFile(path.to_path_buf(), e)),
    };

    Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}
