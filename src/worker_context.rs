//! Worker lock-file lifecycle.
//!
//! Exactly one worker process may run against a given working directory at
//! a time. A YAML lock file records the registered worker-id there; a
//! second worker started against the same directory refuses to run unless
//! `--clean` is passed, which removes the stale lock (and deregisters the
//! old worker-id, best-effort) before proceeding.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorClient;
use crate::error::{Result, WorkerError};

const LOCK_FILE_NAME: &str = "worker.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    worker_id: String,
    username: String,
    queue: String,
}

/// Holds the registered worker-id for the lifetime of a run and guarantees
/// deregistration (and lock removal) on drop, success or failure alike.
pub struct WorkerContext {
    lock_path: PathBuf,
    pub worker_id: String,
    username: String,
    queue: String,
}

impl WorkerContext {
    /// Remove a stale lock file in `working_dir`, if one exists, and
    /// deregister the worker-id it names on a best-effort basis. Used by the
    /// standalone `clean` command, which only ever tears down an existing
    /// lock and never registers a new worker of its own. Returns `true` if a
    /// lock was actually found and removed.
    pub fn clean_stale_lock(working_dir: &Path, client: &CoordinatorClient) -> Result<bool> {
        let lock_path = working_dir.join(LOCK_FILE_NAME);
        if !lock_path.exists() {
            return Ok(false);
        }
        if let Ok(contents) = fs::read_to_string(&lock_path)
            && let Ok(old) = serde_yaml::from_str::<LockFile>(&contents)
        {
            let _ = client.remove_worker(&old.username, &old.queue, &old.worker_id);
        }
        fs::remove_file(&lock_path)?;
        Ok(true)
    }

    /// Register a new worker-id with the coordinator and return it, without
    /// touching the lock file. Used by the standalone `register` subcommand,
    /// which is a one-shot diagnostic: it prints the issued id and exits
    /// without ever persisting a lock (that only happens once `worker`
    /// itself starts its job loop).
    pub fn register_only(
        client: &CoordinatorClient,
        username: &str,
        queue: &str,
        platform: &str,
        hostname: &str,
    ) -> Result<String> {
        client.register_worker(username, queue, platform, hostname)
    }

    /// Acquire the lock for `working_dir`, registering a new worker-id with
    /// the coordinator. If a lock already exists, `clean` must be `true` or
    /// this fails with [`WorkerError::LockHeld`].
    pub fn acquire(
        working_dir: &Path,
        client: &CoordinatorClient,
        username: &str,
        queue: &str,
        platform: &str,
        hostname: &str,
        clean: bool,
    ) -> Result<Self> {
        let lock_path = working_dir.join(LOCK_FILE_NAME);

        if lock_path.exists() {
            if !clean {
                return Err(WorkerError::LockHeld(lock_path.display().to_string()));
            }
            Self::clean_stale_lock(working_dir, client)?;
        }

        let worker_id = client.register_worker(username, queue, platform, hostname)?;

        let lock = LockFile {
            worker_id: worker_id.clone(),
            username: username.to_string(),
            queue: queue.to_string(),
        };
        fs::write(&lock_path, serde_yaml::to_string(&lock)?)?;

        Ok(WorkerContext {
            lock_path,
            worker_id,
            username: username.to_string(),
            queue: queue.to_string(),
        })
    }

    /// Deregister and remove the lock file now, rather than waiting for
    /// `Drop`. Safe to call once; `Drop` is then a no-op.
    pub fn release(&self, client: &CoordinatorClient) {
        let _ = client.remove_worker(&self.username, &self.queue, &self.worker_id);
        let _ = fs::remove_file(&self.lock_path);
    }
}
