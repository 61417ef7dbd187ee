//! Runs a build script under supervision: mirrors its combined stdout and
//! stderr into a [`BuildLog`], and kills it if it goes quiet for too long.
//!
//! The timeout tracked here is I/O inactivity, not wall-clock time — a
//! build that is still chattering away on stdout keeps resetting the
//! clock no matter how long it has been running in total.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::buildlog::BuildLog;
use crate::error::{Result, WorkerError};
use crate::line_splitter::LineSplitter;

/// Exit code the worker reports when the supervisor kills the child after
/// an I/O-inactivity timeout.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code the worker reports when the supervisor kills the child
/// because [`terminate`] was requested (not a timeout).
pub const EXIT_KILLED: i32 = 125;

/// How the supervised process actually stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Ran to completion; the code is the child's own exit status.
    Exited(i32),
    TimedOut,
    Killed,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Exited(code) => code,
            Outcome::TimedOut => EXIT_TIMED_OUT,
            Outcome::Killed => EXIT_KILLED,
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Spawn `command` with piped stdout/stderr, stream both into `sink`, and
/// block until it exits, times out, or `terminate` is flipped from another
/// thread.
pub fn supervise(
    mut command: Command,
    sink: Arc<Mutex<BuildLog>>,
    iotimeout: Duration,
    terminate: Arc<AtomicBool>,
) -> Result<Outcome> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let last_activity = Arc::new(Mutex::new(Instant::now()));

    let out_thread = spawn_reader(stdout, Arc::clone(&sink), Arc::clone(&last_activity));
    let err_thread = spawn_reader(stderr, Arc::clone(&sink), Arc::clone(&last_activity));

    let outcome = poll_until_done(&mut child, &last_activity, iotimeout, &terminate);

    let _ = out_thread.join();
    let _ = err_thread.join();
    sink.lock().unwrap().flush()?;

    Ok(outcome)
}

fn poll_until_done(
    child: &mut Child,
    last_activity: &Arc<Mutex<Instant>>,
    iotimeout: Duration,
    terminate: &Arc<AtomicBool>,
) -> Outcome {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Outcome::Exited(status.code().unwrap_or(1));
            }
            Ok(None) => {}
            Err(_) => return Outcome::Exited(EXIT_KILLED),
        }

        if terminate.load(Ordering::SeqCst) {
            kill(child);
            let _ = child.wait();
            return Outcome::Killed;
        }

        let idle_for = last_activity.lock().unwrap().elapsed();
        if idle_for >= iotimeout {
            kill(child);
            let _ = child.wait();
            return Outcome::TimedOut;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + GRACE_PERIOD;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    sink: Arc<Mutex<BuildLog>>,
    last_activity: Arc<Mutex<Instant>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut splitter = LineSplitter::new(reader);
        loop {
            match splitter.next_line() {
                Ok(Some(line)) => {
                    *last_activity.lock().unwrap() = Instant::now();
                    if let Ok(mut log) = sink.lock() {
                        let _ = log.write_line(&line);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    })
}

/// Convenience wrapper translating a non-exited [`Outcome`] into a
/// [`WorkerError`], for callers that want `?`-propagation once the job loop
/// has already recorded the supervised run.
pub fn outcome_to_error(outcome: Outcome, iotimeout: Duration) -> Option<WorkerError> {
    match outcome {
        Outcome::TimedOut => Some(WorkerError::ChildTimeout(iotimeout.as_secs())),
        Outcome::Killed => Some(WorkerError::ChildKilled),
        Outcome::Exited(_) => None,
    }
}
