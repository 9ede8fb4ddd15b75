use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupManager;
use crate::config::Config;
use crate::error::{QueueError, QueueResult};
use crate::lock::LockManager;
use crate::logger::Logger;
use crate::queue::{QueueEngine, QueuePolicy};
use crate::store::Store;

pub(crate) const STORE_FILE: &str = "tasks.json";
pub(crate) const BACKUP_DIR: &str = "backups";

/// One queue directory with its store, backups and lock wired together.
#[derive(Debug)]
pub(crate) struct Workspace {
    store: Store,
    backups: BackupManager,
    backups_enabled: bool,
    backup_retention_days: i64,
    lock: LockManager,
    lock_timeout: Duration,
    policy: QueuePolicy,
    logger: Logger,
}

impl Workspace {
    pub(crate) fn open(
        config: &Config,
        queue_dir: PathBuf,
        logger: Logger,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> QueueResult<Self> {
        fs::create_dir_all(&queue_dir).map_err(|err| {
            QueueError::io(
                format!("Failed to create queue directory {}", queue_dir.display()),
                err,
            )
        })?;
        let store_path = queue_dir.join(STORE_FILE);
        let backups = BackupManager::new(queue_dir.join(BACKUP_DIR), store_path.clone());
        let mut store = Store::new(store_path.clone());
        if config.backups.enabled {
            store = store.with_backups(backups.clone());
        }
        let mut lock = LockManager::for_store(
            config.lock.backend,
            &store_path,
            Duration::from_secs(config.lock.stale_after_secs),
        )?;
        if let Some(flag) = interrupt {
            lock = lock.with_interrupt(flag);
        }

        Ok(Self {
            store,
            backups,
            backups_enabled: config.backups.enabled,
            backup_retention_days: config.backups.retention_days,
            lock,
            lock_timeout: Duration::from_secs(config.lock.timeout_secs),
            policy: QueuePolicy::from_config(config),
            logger,
        })
    }

    pub(crate) fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub(crate) fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub(crate) fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Loads the store without taking the lock. A concurrent writer is either
    /// fully visible or not at all, since saves are atomic renames.
    pub(crate) fn read(&self) -> QueueResult<QueueEngine> {
        Ok(QueueEngine::new(self.store.load()?, self.policy))
    }

    /// Runs `f` against a fresh load under the lock and saves if it changed
    /// anything. An error from `f` leaves the file untouched.
    pub(crate) fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueEngine) -> QueueResult<T>,
    ) -> QueueResult<T> {
        self.lock.with_lock(self.lock_timeout, &self.logger, || {
            let mut engine = self.read()?;
            let value = f(&mut engine)?;
            if engine.is_dirty() {
                self.store.save(engine.index(), &self.logger)?;
                self.prune_backups()?;
            }
            Ok(value)
        })
    }

    /// Runs `f` under the lock without loading the store (backup restore).
    pub(crate) fn locked<T>(&self, f: impl FnOnce() -> QueueResult<T>) -> QueueResult<T> {
        self.lock.with_lock(self.lock_timeout, &self.logger, f)
    }

    fn prune_backups(&self) -> QueueResult<()> {
        if !self.backups_enabled {
            return Ok(());
        }
        let removed = self.backups.cleanup(self.backup_retention_days)?;
        if removed > 0 {
            self.logger.log_event(
                "backup_cleanup",
                &[
                    ("removed", &removed),
                    ("retention_days", &self.backup_retention_days),
                ],
            );
        }
        Ok(())
    }
}
