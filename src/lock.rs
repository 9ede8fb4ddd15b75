use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

use crate::config::LockBackendKind;
use crate::error::{QueueError, QueueResult};
use crate::logger::Logger;
use crate::store::write_atomic;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
const OWNER_FILE: &str = "owner.json";

/// Identity of the process holding the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LockOwner {
    pub(crate) pid: u32,
    pub(crate) hostname: String,
    pub(crate) acquired_at: DateTime<Utc>,
    pub(crate) token: String,
}

impl LockOwner {
    pub(crate) fn current() -> Self {
        Self {
            pid: process::id(),
            hostname: current_hostname(),
            acquired_at: Utc::now(),
            token: Uuid::new_v4().simple().to_string(),
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LockStatus {
    Unlocked,
    /// `owner` is `None` while a fresh lock is between creation and its owner write.
    Held { owner: Option<LockOwner> },
    Stale {
        owner: Option<LockOwner>,
        reason: String,
    },
}

/// A held lock. Releasing twice is a no-op.
pub(crate) trait LockHandle: fmt::Debug {
    fn release(&mut self) -> QueueResult<()>;
}

/// One way of marking the store as owned by a single process.
pub(crate) trait LockBackend: fmt::Debug {
    fn marker_path(&self) -> &Path;

    /// Single non-blocking attempt. `Ok(None)` means somebody else holds it.
    fn try_acquire(&self, owner: &LockOwner) -> QueueResult<Option<Box<dyn LockHandle>>>;

    fn inspect(&self) -> QueueResult<LockStatus>;

    /// Removes the marker only if `inspect` judges it stale.
    fn reclaim_stale(&self) -> QueueResult<Option<LockStatus>>;

    /// Removes the marker unconditionally. Returns whether one existed.
    fn force_remove(&self) -> QueueResult<bool>;
}

/// Which marker directory was judged. A replacement marker differs in inode
/// (unix) or mtime even before its owner record exists.
#[derive(Debug, PartialEq, Eq)]
struct MarkerIdentity {
    modified: Option<SystemTime>,
    #[cfg(unix)]
    inode: u64,
}

/// Portable backend: `create_dir` is atomic, so the directory itself is the
/// mutex. The owner record inside it drives staleness detection.
#[derive(Debug)]
pub(crate) struct DirectoryLock {
    dir: PathBuf,
    stale_after: Duration,
}

impl DirectoryLock {
    pub(crate) fn new(dir: PathBuf, stale_after: Duration) -> Self {
        Self { dir, stale_after }
    }

    fn owner_path(&self) -> PathBuf {
        self.dir.join(OWNER_FILE)
    }

    fn read_owner(&self) -> Option<LockOwner> {
        read_owner_file(&self.owner_path())
    }

    fn marker_identity(&self) -> Option<MarkerIdentity> {
        let meta = fs::metadata(&self.dir).ok()?;
        Some(MarkerIdentity {
            modified: meta.modified().ok(),
            #[cfg(unix)]
            inode: std::os::unix::fs::MetadataExt::ino(&meta),
        })
    }

    /// Removes the marker judged as `status` unless it changed hands since
    /// `seen` was taken.
    fn remove_if_unchanged(
        &self,
        status: LockStatus,
        seen: Option<MarkerIdentity>,
    ) -> QueueResult<Option<LockStatus>> {
        let LockStatus::Stale { owner, .. } = &status else {
            return Ok(None);
        };
        let unchanged = match owner {
            Some(owner) => self
                .read_owner()
                .is_some_and(|current| current.token == owner.token),
            // No token to compare: it must be the very directory we judged.
            None => {
                seen.is_some() && self.read_owner().is_none() && self.marker_identity() == seen
            }
        };
        if !unchanged {
            return Ok(None);
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(Some(status)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(QueueError::io(
                format!("Failed to remove stale lock {}", self.dir.display()),
                err,
            )),
        }
    }

    fn marker_age(&self) -> Duration {
        fs::metadata(&self.dir)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO)
    }

    fn judge(&self, owner: Option<LockOwner>) -> LockStatus {
        let Some(owner) = owner else {
            let age = self.marker_age();
            if age >= self.stale_after {
                return LockStatus::Stale {
                    owner: None,
                    reason: format!(
                        "no owner record and marker age {}s exceeds {}s",
                        age.as_secs(),
                        self.stale_after.as_secs()
                    ),
                };
            }
            return LockStatus::Held { owner: None };
        };

        if owner.hostname == current_hostname() && !process_alive(owner.pid) {
            let reason = format!("holder process {} no longer exists", owner.pid);
            return LockStatus::Stale {
                owner: Some(owner),
                reason,
            };
        }
        let age = owner.age(Utc::now());
        if age >= self.stale_after {
            let reason = format!(
                "lock age {}s exceeds {}s",
                age.as_secs(),
                self.stale_after.as_secs()
            );
            return LockStatus::Stale {
                owner: Some(owner),
                reason,
            };
        }
        LockStatus::Held { owner: Some(owner) }
    }
}

impl LockBackend for DirectoryLock {
    fn marker_path(&self) -> &Path {
        &self.dir
    }

    fn try_acquire(&self, owner: &LockOwner) -> QueueResult<Option<Box<dyn LockHandle>>> {
        match fs::create_dir(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => {
                return Err(QueueError::io(
                    format!("Failed to create lock {}", self.dir.display()),
                    err,
                ))
            }
        }

        let record = serde_json::to_vec(owner).map_err(|err| {
            QueueError::io(
                "Failed to encode lock owner",
                io::Error::new(io::ErrorKind::InvalidData, err),
            )
        })?;
        if let Err(err) = write_atomic(&self.owner_path(), &record) {
            let _ = fs::remove_dir_all(&self.dir);
            return Err(QueueError::io(
                format!("Failed to record lock owner in {}", self.dir.display()),
                err,
            ));
        }

        Ok(Some(Box::new(DirectoryHandle {
            dir: self.dir.clone(),
            token: owner.token.clone(),
            released: false,
        })))
    }

    fn inspect(&self) -> QueueResult<LockStatus> {
        if !self.dir.exists() {
            return Ok(LockStatus::Unlocked);
        }
        Ok(self.judge(self.read_owner()))
    }

    fn reclaim_stale(&self) -> QueueResult<Option<LockStatus>> {
        let seen = self.marker_identity();
        let status = self.inspect()?;
        self.remove_if_unchanged(status, seen)
    }

    fn force_remove(&self) -> QueueResult<bool> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(QueueError::io(
                format!("Failed to remove lock {}", self.dir.display()),
                err,
            )),
        }
    }
}

#[derive(Debug)]
struct DirectoryHandle {
    dir: PathBuf,
    token: String,
    released: bool,
}

impl LockHandle for DirectoryHandle {
    fn release(&mut self) -> QueueResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        // After a force-unlock the marker may belong to someone else now.
        let owner = read_owner_file(&self.dir.join(OWNER_FILE));
        if owner.is_some_and(|owner| owner.token != self.token) {
            return Ok(());
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(QueueError::io(
                format!("Failed to release lock {}", self.dir.display()),
                err,
            )),
        }
    }
}

#[cfg(unix)]
mod flock {
    use super::*;
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};

    /// Advisory `flock(2)` on a sibling file. The kernel drops it when the
    /// holder exits, so this backend never reports a stale lock.
    #[derive(Debug)]
    pub(crate) struct FlockLock {
        path: PathBuf,
    }

    impl FlockLock {
        pub(crate) fn new(path: PathBuf) -> Self {
            Self { path }
        }

        fn open(&self) -> QueueResult<File> {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(|err| {
                    QueueError::io(format!("Failed to open lock {}", self.path.display()), err)
                })
        }

        fn lock_nonblocking(&self, file: File) -> QueueResult<Option<Flock<File>>> {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => Ok(Some(lock)),
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
                Err((_, errno)) => Err(QueueError::io(
                    format!("Failed to lock {}", self.path.display()),
                    io::Error::from(errno),
                )),
            }
        }
    }

    impl LockBackend for FlockLock {
        fn marker_path(&self) -> &Path {
            &self.path
        }

        fn try_acquire(&self, owner: &LockOwner) -> QueueResult<Option<Box<dyn LockHandle>>> {
            let file = self.open()?;
            let Some(mut lock) = self.lock_nonblocking(file)? else {
                return Ok(None);
            };
            let record = serde_json::to_vec(owner).map_err(|err| {
                QueueError::io(
                    "Failed to encode lock owner",
                    io::Error::new(io::ErrorKind::InvalidData, err),
                )
            })?;
            let write = lock
                .set_len(0)
                .and_then(|()| lock.seek(SeekFrom::Start(0)).map(|_| ()))
                .and_then(|()| lock.write_all(&record));
            write.map_err(|err| {
                QueueError::io(
                    format!("Failed to record lock owner in {}", self.path.display()),
                    err,
                )
            })?;
            Ok(Some(Box::new(FlockHandle { lock: Some(lock) })))
        }

        fn inspect(&self) -> QueueResult<LockStatus> {
            if !self.path.exists() {
                return Ok(LockStatus::Unlocked);
            }
            let mut file = self.open()?;
            let mut contents = String::new();
            let owner = file
                .read_to_string(&mut contents)
                .ok()
                .and_then(|_| serde_json::from_str::<LockOwner>(&contents).ok());
            match self.lock_nonblocking(file)? {
                Some(_probe) => Ok(LockStatus::Unlocked),
                None => Ok(LockStatus::Held { owner }),
            }
        }

        fn reclaim_stale(&self) -> QueueResult<Option<LockStatus>> {
            Ok(None)
        }

        fn force_remove(&self) -> QueueResult<bool> {
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(QueueError::io(
                    format!("Failed to remove lock {}", self.path.display()),
                    err,
                )),
            }
        }
    }

    #[derive(Debug)]
    struct FlockHandle {
        lock: Option<Flock<File>>,
    }

    impl LockHandle for FlockHandle {
        fn release(&mut self) -> QueueResult<()> {
            let Some(lock) = self.lock.take() else {
                return Ok(());
            };
            let _ = lock.set_len(0);
            lock.unlock().map(|_| ()).map_err(|(_, errno)| {
                QueueError::io("Failed to unlock", io::Error::from(errno))
            })
        }
    }
}

#[cfg(unix)]
pub(crate) use flock::FlockLock;

/// Serializes read-modify-write cycles on the store across processes.
#[derive(Debug)]
pub(crate) struct LockManager {
    backend: Box<dyn LockBackend>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl LockManager {
    pub(crate) fn new(backend: Box<dyn LockBackend>) -> Self {
        Self {
            backend,
            interrupt: None,
        }
    }

    /// Builds the configured backend for the store at `store_path`.
    pub(crate) fn for_store(
        kind: LockBackendKind,
        store_path: &Path,
        stale_after: Duration,
    ) -> QueueResult<Self> {
        let backend: Box<dyn LockBackend> = match kind {
            LockBackendKind::Directory => Box::new(DirectoryLock::new(
                sibling_path(store_path, "lock"),
                stale_after,
            )),
            #[cfg(unix)]
            LockBackendKind::Flock => Box::new(FlockLock::new(sibling_path(store_path, "flock"))),
            #[cfg(not(unix))]
            LockBackendKind::Flock => {
                return Err(QueueError::Validation(
                    "lock.backend flock is only available on unix".to_string(),
                ))
            }
        };
        Ok(Self::new(backend))
    }

    /// Abort lock waits once `flag` is set (wired to Ctrl-C).
    pub(crate) fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub(crate) fn marker_path(&self) -> &Path {
        self.backend.marker_path()
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub(crate) fn acquire(&self, timeout: Duration, logger: &Logger) -> QueueResult<LockGuard> {
        let owner = LockOwner::current();
        let started = Instant::now();
        let mut delay = INITIAL_BACKOFF;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(handle) = self.backend.try_acquire(&owner)? {
                logger.log_event(
                    "lock_acquired",
                    &[
                        ("path", &self.marker_path().display()),
                        ("attempts", &attempts),
                    ],
                );
                return Ok(LockGuard {
                    handle: Some(handle),
                });
            }

            let reclaimed = self.backend.reclaim_stale()?;
            if let Some(LockStatus::Stale { owner, reason }) = &reclaimed {
                let holder = owner
                    .as_ref()
                    .map(|owner| owner.pid.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                logger.log_event(
                    "lock_reclaimed",
                    &[
                        ("path", &self.marker_path().display()),
                        ("holder", &holder),
                        ("reason", reason),
                    ],
                );
            }

            if self.interrupted() {
                return Err(QueueError::Interrupted {
                    path: self.marker_path().to_path_buf(),
                });
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                logger.log_event(
                    "lock_timeout",
                    &[
                        ("path", &self.marker_path().display()),
                        ("waited_ms", &elapsed.as_millis()),
                    ],
                );
                return Err(QueueError::LockTimeout {
                    path: self.marker_path().to_path_buf(),
                    waited: elapsed,
                });
            }
            if reclaimed.is_none() {
                thread::sleep(delay.min(timeout - elapsed));
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }

    pub(crate) fn release(&self, guard: &mut LockGuard, logger: &Logger) -> QueueResult<()> {
        if guard.is_held() {
            guard.release()?;
            logger.log_event("lock_released", &[("path", &self.marker_path().display())]);
        }
        Ok(())
    }

    /// Runs `f` while holding the lock. The guard is released on every exit
    /// path, including errors and unwinding panics.
    pub(crate) fn with_lock<T>(
        &self,
        timeout: Duration,
        logger: &Logger,
        f: impl FnOnce() -> QueueResult<T>,
    ) -> QueueResult<T> {
        let mut guard = self.acquire(timeout, logger)?;
        let result = f();
        let released = self.release(&mut guard, logger);
        let value = result?;
        released?;
        Ok(value)
    }

    pub(crate) fn status(&self) -> QueueResult<LockStatus> {
        self.backend.inspect()
    }

    /// Removes the lock only when it is stale.
    pub(crate) fn cleanup_stale(&self, logger: &Logger) -> QueueResult<Option<LockStatus>> {
        let reclaimed = self.backend.reclaim_stale()?;
        if let Some(LockStatus::Stale { reason, .. }) = &reclaimed {
            logger.log_event(
                "lock_reclaimed",
                &[("path", &self.marker_path().display()), ("reason", reason)],
            );
        }
        Ok(reclaimed)
    }

    /// Removes the lock unconditionally. Unsafe if the holder is still running:
    /// two processes may then mutate the store at once.
    pub(crate) fn force_unlock(&self, logger: &Logger) -> QueueResult<bool> {
        let removed = self.backend.force_remove()?;
        if removed {
            logger.log_event("lock_forced", &[("path", &self.marker_path().display())]);
        }
        Ok(removed)
    }
}

#[derive(Debug)]
pub(crate) struct LockGuard {
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub(crate) fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn release(&mut self) -> QueueResult<()> {
        match self.handle.take() {
            Some(mut handle) => handle.release(),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn sibling_path(store_path: &Path, extension: &str) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "tasks.json".into());
    name.push(".");
    name.push(extension);
    store_path.with_file_name(name)
}

fn read_owner_file(path: &Path) -> Option<LockOwner> {
    let contents = fs::read(path).ok()?;
    serde_json::from_slice(&contents).ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 probes existence; EPERM means it exists under another user.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No portable probe; fall back to the age threshold alone.
    true
}

#[cfg(unix)]
pub(crate) fn current_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
pub(crate) fn current_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
