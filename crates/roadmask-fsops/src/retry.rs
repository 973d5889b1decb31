//! Bounded retry for filesystem operations on flaky network shares.
//!
//! [`with_retry`] is a plain combinator: it knows nothing about IO and takes a
//! classifier that labels each error transient or terminal. [`RetryingFileIo`]
//! layers event publishing and metrics on top for the concrete operations the
//! pipeline performs.

use std::fmt::Display;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use roadmask_config::IoConfig;
use roadmask_events::{Event, EventBus};
use roadmask_telemetry::Metrics;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{FsOpsError, FsOpsResult};

/// Retry budget shared by every filesystem operation of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    timeout: Duration,
    poll_interval: Duration,
}

impl RetryPolicy {
    /// Give up once `timeout` has elapsed, sleeping `poll_interval` between attempts.
    #[must_use]
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Build the policy from the `io` configuration section.
    #[must_use]
    pub const fn from_config(config: &IoConfig) -> Self {
        Self::new(config.retry_timeout(), config.poll_interval())
    }

    /// Total retry budget per operation.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Classifier verdict for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying.
    Transient,
    /// Propagate immediately.
    Terminal,
}

/// Information handed to the retry observer before each pause.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Attempt that just failed, starting at 1.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// Error from the failed attempt.
    pub error: &'a E,
}

/// Failure returned by [`with_retry`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// Classified terminal; returned after the first occurrence.
    Terminal(E),
    /// Still transient when the budget ran out.
    Exhausted {
        /// Last error observed.
        cause: E,
        /// Time spent, never less than the policy timeout.
        elapsed: Duration,
        /// Attempts made.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Underlying error, whichever way the retry ended.
    pub fn into_cause(self) -> E {
        match self {
            Self::Terminal(cause) | Self::Exhausted { cause, .. } => cause,
        }
    }
}

/// Run `operation` until it succeeds, fails terminally, or the policy's
/// timeout elapses.
///
/// The first attempt runs immediately. After a transient failure the caller's
/// `on_retry` observer runs, then the thread sleeps for the poll interval
/// (clipped to the remaining budget) before trying again. This blocks the
/// calling thread, so async callers must run it on a blocking pool.
///
/// # Errors
///
/// Returns [`RetryError::Terminal`] for the first terminal error and
/// [`RetryError::Exhausted`] once elapsed time reaches the timeout.
pub fn with_retry<T, E, C, O, F>(
    policy: &RetryPolicy,
    classify: C,
    mut on_retry: O,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    C: Fn(&E) -> ErrorClass,
    O: FnMut(RetryAttempt<'_, E>),
    F: FnMut() -> Result<T, E>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if classify(&err) == ErrorClass::Terminal {
            return Err(RetryError::Terminal(err));
        }
        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(RetryError::Exhausted {
                cause: err,
                elapsed,
                attempts: attempt,
            });
        }
        on_retry(RetryAttempt {
            attempt,
            elapsed,
            error: &err,
        });
        let remaining = policy.timeout.saturating_sub(elapsed);
        thread::sleep(policy.poll_interval.min(remaining));
    }
}

/// Label IO errors typical of locked files and flapping network mounts as
/// transient.
#[must_use]
pub fn classify_io_error(err: &io::Error) -> ErrorClass {
    if cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33)) {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        return ErrorClass::Transient;
    }
    match err.kind() {
        ErrorKind::NotFound
        | ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ResourceBusy
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NetworkDown
        | ErrorKind::NetworkUnreachable
        | ErrorKind::HostUnreachable
        | ErrorKind::StaleNetworkFileHandle => ErrorClass::Transient,
        _ => ErrorClass::Terminal,
    }
}

/// Filesystem facade that retries transient failures and reports them.
#[derive(Clone)]
pub struct RetryingFileIo {
    policy: RetryPolicy,
    events: EventBus,
    metrics: Metrics,
}

impl RetryingFileIo {
    /// Wrap the filesystem with `policy`, reporting retries to `events` and `metrics`.
    #[must_use]
    pub const fn new(policy: RetryPolicy, events: EventBus, metrics: Metrics) -> Self {
        Self {
            policy,
            events,
            metrics,
        }
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry an arbitrary fallible operation with a caller-supplied classifier,
    /// reporting each retry and the final exhaustion.
    ///
    /// # Errors
    ///
    /// See [`with_retry`].
    pub fn retry<T, E, C, F>(
        &self,
        operation: &'static str,
        path: &Path,
        classify: C,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Display,
        C: Fn(&E) -> ErrorClass,
        F: FnMut() -> Result<T, E>,
    {
        let result = with_retry(
            &self.policy,
            classify,
            |attempt: RetryAttempt<'_, E>| {
                debug!(
                    operation,
                    path = %path.display(),
                    attempt = attempt.attempt,
                    elapsed_ms = duration_ms(attempt.elapsed),
                    error = %attempt.error,
                    "transient filesystem error; retrying"
                );
                self.metrics.inc_retry(operation);
                self.publish(Event::RetryScheduled {
                    operation: operation.to_string(),
                    path: path.display().to_string(),
                    attempt: attempt.attempt,
                    elapsed_ms: duration_ms(attempt.elapsed),
                    cause: attempt.error.to_string(),
                });
            },
            op,
        );
        if let Err(RetryError::Exhausted {
            cause,
            elapsed,
            attempts,
        }) = &result
        {
            error!(
                operation,
                path = %path.display(),
                attempts,
                elapsed_ms = duration_ms(*elapsed),
                error = %cause,
                "filesystem operation gave up after retries"
            );
            self.publish(Event::RetryExhausted {
                operation: operation.to_string(),
                path: path.display().to_string(),
                attempts: *attempts,
                elapsed_ms: duration_ms(*elapsed),
                cause: cause.to_string(),
            });
        }
        result
    }

    /// Retry an IO operation using [`classify_io_error`].
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::Io`] for terminal errors and
    /// [`FsOpsError::FileAccess`] when retries are exhausted.
    pub fn run<T, F>(&self, operation: &'static str, path: &Path, op: F) -> FsOpsResult<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        self.retry(operation, path, classify_io_error, op)
            .map_err(|err| match err {
                RetryError::Terminal(source) => FsOpsError::io(operation, path, source),
                RetryError::Exhausted {
                    cause,
                    elapsed,
                    attempts,
                } => FsOpsError::FileAccess {
                    operation,
                    path: path.to_path_buf(),
                    elapsed,
                    attempts,
                    source: cause,
                },
            })
    }

    /// Read a whole file.
    ///
    /// # Errors
    ///
    /// See [`RetryingFileIo::run`].
    pub fn read(&self, path: &Path) -> FsOpsResult<Vec<u8>> {
        self.run("read", path, || fs::read(path))
    }

    /// Create `dir` and its parents; an existing directory is success.
    ///
    /// # Errors
    ///
    /// See [`RetryingFileIo::run`].
    pub fn create_dir_all(&self, dir: &Path) -> FsOpsResult<()> {
        self.run("create_dir", dir, || match fs::create_dir_all(dir) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
            other => other,
        })
    }

    /// Write `bytes` to a sibling temp file and rename it over `path`, so
    /// readers never observe a partially written file.
    ///
    /// # Errors
    ///
    /// See [`RetryingFileIo::run`].
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> FsOpsResult<()> {
        self.ensure_parent(path)?;
        let temp = temp_sibling(path)?;
        self.run("write", path, || {
            stage_then_rename(&temp, path, |temp| fs::write(temp, bytes))
        })
    }

    /// Copy `source` to a temp file next to `destination` and rename it into place.
    ///
    /// # Errors
    ///
    /// See [`RetryingFileIo::run`].
    pub fn copy_atomic(&self, source: &Path, destination: &Path) -> FsOpsResult<()> {
        self.ensure_parent(destination)?;
        let temp = temp_sibling(destination)?;
        self.run("copy", destination, || {
            stage_then_rename(&temp, destination, |temp| fs::copy(source, temp).map(drop))
        })
    }

    /// Remove a file; a file that is already gone is success.
    ///
    /// # Errors
    ///
    /// See [`RetryingFileIo::run`].
    pub fn remove_file(&self, path: &Path) -> FsOpsResult<()> {
        self.run("remove", path, || match fs::remove_file(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        })
    }

    fn ensure_parent(&self, path: &Path) -> FsOpsResult<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn publish(&self, event: Event) {
        self.metrics.inc_event(event.kind());
        let _ = self.events.publish(event);
    }
}

fn temp_sibling(path: &Path) -> FsOpsResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| FsOpsError::InvalidInput {
            field: "path",
            reason: "missing file name",
            value: Some(path.display().to_string()),
        })?
        .to_string_lossy();
    Ok(path.with_file_name(format!(".{name}.tmp-{}", Uuid::new_v4().simple())))
}

/// Fill `temp` with `stage` and rename it over `destination`. The temp file
/// is removed whenever either step fails.
fn stage_then_rename<F>(temp: &Path, destination: &Path, stage: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    stage(temp)
        .and_then(|()| fs::rename(temp, destination))
        .inspect_err(|_| {
            let _ = fs::remove_file(temp);
        })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::cell::Cell;
    use tempfile::TempDir;

    const fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(200), Duration::from_millis(10))
    }

    fn file_io(policy: RetryPolicy) -> Result<(RetryingFileIo, EventBus, Metrics)> {
        let events = EventBus::new();
        let metrics = Metrics::new()?;
        Ok((
            RetryingFileIo::new(policy, events.clone(), metrics.clone()),
            events,
            metrics,
        ))
    }

    fn not_found() -> io::Error {
        io::Error::new(ErrorKind::NotFound, "share not mounted")
    }

    #[test]
    fn transient_error_resolving_within_budget_succeeds() {
        let calls = Cell::new(0_u32);
        let mut observed = Vec::new();
        let result = with_retry(
            &fast_policy(),
            classify_io_error,
            |attempt| observed.push(attempt.attempt),
            || {
                calls.set(calls.get() + 1);
                if calls.get() <= 3 {
                    Err(not_found())
                } else {
                    Ok("done")
                }
            },
        );
        assert!(matches!(result, Ok("done")));
        assert_eq!(calls.get(), 4);
        assert_eq!(observed, vec![1, 2, 3]);
    }

    #[test]
    fn never_resolving_error_exhausts_after_timeout() {
        let policy = fast_policy();
        let result: Result<(), RetryError<io::Error>> =
            with_retry(&policy, classify_io_error, |_| {}, || Err(not_found()));
        match result {
            Err(RetryError::Exhausted {
                elapsed, attempts, ..
            }) => {
                assert!(elapsed >= policy.timeout());
                assert!(attempts > 1);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn terminal_error_is_not_retried() {
        let calls = Cell::new(0_u32);
        let result: Result<(), RetryError<io::Error>> = with_retry(
            &fast_policy(),
            classify_io_error,
            |_| panic!("terminal errors must not be retried"),
            || {
                calls.set(calls.get() + 1);
                Err(io::Error::new(ErrorKind::PermissionDenied, "denied"))
            },
        );
        assert!(matches!(result, Err(RetryError::Terminal(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_timeout_gives_up_after_first_attempt() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::from_millis(10));
        let result: Result<(), RetryError<io::Error>> =
            with_retry(&policy, classify_io_error, |_| {}, || Err(not_found()));
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
    }

    #[test]
    fn classifier_separates_transient_from_terminal() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::TimedOut,
            ErrorKind::ResourceBusy,
            ErrorKind::StaleNetworkFileHandle,
        ] {
            assert_eq!(
                classify_io_error(&io::Error::from(kind)),
                ErrorClass::Transient
            );
        }
        for kind in [ErrorKind::PermissionDenied, ErrorKind::InvalidData] {
            assert_eq!(
                classify_io_error(&io::Error::from(kind)),
                ErrorClass::Terminal
            );
        }
    }

    #[test]
    fn read_of_missing_file_reports_file_access_and_events() -> Result<()> {
        let dir = TempDir::new()?;
        let (io, events, metrics) = file_io(RetryPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(10),
        ))?;
        let missing = dir.path().join("absent.jpg");

        let err = match io.read(&missing) {
            Err(err) => err,
            Ok(_) => anyhow::bail!("read of a missing file succeeded"),
        };
        assert!(err.is_timeout());

        let kinds: Vec<_> = events
            .backlog_since(0)
            .into_iter()
            .map(|env| env.event.kind())
            .collect();
        assert!(kinds.contains(&"retry_scheduled"));
        assert_eq!(kinds.last(), Some(&"retry_exhausted"));
        assert!(metrics.render()?.contains("file_retries_total{operation=\"read\"}"));
        Ok(())
    }

    #[test]
    fn write_atomic_creates_parents_and_leaves_no_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let (io, _, _) = file_io(fast_policy())?;
        let target = dir.path().join("a").join("b").join("out.json");

        io.write_atomic(&target, b"{}")?;
        io.write_atomic(&target, b"{\"v\":2}")?;

        assert_eq!(fs::read(&target)?, b"{\"v\":2}");
        let siblings = fs::read_dir(dir.path().join("a").join("b"))?.count();
        assert_eq!(siblings, 1);
        Ok(())
    }

    #[test]
    fn failed_staging_removes_the_partial_temp_file() -> Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("out.jpg");
        let temp = temp_sibling(&destination)?;

        let result = stage_then_rename(&temp, &destination, |temp| {
            fs::write(temp, b"partial")?;
            Err(io::Error::new(ErrorKind::StorageFull, "disk full"))
        });

        assert!(result.is_err());
        assert!(!temp.exists());
        assert!(!destination.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn copy_atomic_of_a_missing_source_leaves_no_temp_files() -> Result<()> {
        let dir = TempDir::new()?;
        let (io, _, _) = file_io(RetryPolicy::new(Duration::ZERO, Duration::from_millis(1)))?;
        let destination = dir.path().join("archive").join("gone.jpg");

        assert!(io.copy_atomic(&dir.path().join("gone.jpg"), &destination).is_err());
        assert_eq!(fs::read_dir(dir.path().join("archive"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn copy_atomic_and_remove_file_round_out_the_facade() -> Result<()> {
        let dir = TempDir::new()?;
        let (io, _, _) = file_io(fast_policy())?;
        let source = dir.path().join("in.jpg");
        fs::write(&source, b"jpeg")?;
        let destination = dir.path().join("archive").join("in.jpg");

        io.copy_atomic(&source, &destination)?;
        assert_eq!(fs::read(&destination)?, b"jpeg");

        io.remove_file(&source)?;
        io.remove_file(&source)?;
        assert!(!source.exists());

        io.create_dir_all(&dir.path().join("archive"))?;
        Ok(())
    }
}
