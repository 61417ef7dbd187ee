//! The worker's pop / build / finish cycle.
//!
//! [`work_forever`] polls the coordinator for a job, hands it to
//! [`build_job`] for the full build-script lifecycle, and repeats until
//! told to stop or until the coordinator reports this worker-id no longer
//! exists (fatal — someone removed this worker out from under it). Every
//! other error during a single job's build is recoverable: it's logged, the
//! job is reported to the coordinator as `(failed=true, status=error)` on a
//! best-effort basis, and the loop moves on to the next job. The journal's
//! `starting build` / `finished build` lines are written unconditionally
//! around the attempt, regardless of how it turned out.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::buildlog::BuildLog;
use crate::config::Config;
use crate::coordinator::{CoordinatorClient, CoordinatorLogTransport};
use crate::error::{Result, WorkerError};
use crate::model::JobData;
use crate::script_gen::{self, GenOpts, ScriptTarget};
use crate::supervisor::{self, Outcome};
use crate::worker_context::WorkerContext;

/// How long to sleep between pops when the coordinator reports no job ready.
const SLEEP_TIME: Duration = Duration::from_secs(10);

/// Append one human-readable line to the journal, flushed before returning
/// so a crash right after this call never loses the record.
fn journal(path: &Path, line: &str) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{line}");
        let _ = f.flush();
    }
}

/// Classify a build script's own exit code into the three-way build result
/// the coordinator expects. Anything other than the documented `0`/`11`/`12`
/// is treated as an error, same as an explicit `11`.
pub fn classify(exit_code: i32) -> &'static str {
    match exit_code {
        0 => "success",
        12 => "failure",
        _ => "error",
    }
}

pub fn work_forever(
    cfg: &Config,
    client: &Arc<CoordinatorClient>,
    ctx: &WorkerContext,
    terminate: Arc<AtomicBool>,
) -> Result<()> {
    let journal_path = cfg.working_dir.join("journal.csv");

    loop {
        if terminate.load(Ordering::SeqCst) {
            return Ok(());
        }

        match client.pop_build_job(&cfg.username, &cfg.queue, &ctx.worker_id) {
            Ok(Some(job)) => {
                let job_id = job.job_id().to_string();
                let job_name = job.job_name.clone();

                journal(&journal_path, &format!("starting build, {job_id}, {job_name}"));
                info!(job_id = %job_id, job_name = %job_name, "starting build");

                // Any failure between here and finish_build is reported to
                // the coordinator as (failed=true, status=error) rather than
                // silently dropping the job's fate — the journal's "finished
                // build" line is written unconditionally either way.
                let (failed, status) = match build_job(cfg, client, &job, Arc::clone(&terminate)) {
                    Ok((_exit_code, status)) => (status != "success", status),
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "build did not complete");
                        (true, "error")
                    }
                };

                if let Err(e) = client.finish_build(&job, failed, status) {
                    warn!(job_id = %job_id, error = %e, "failed to report build result to coordinator");
                }
                journal(&journal_path, &format!("finished build, {job_id}, {job_name}"));
            }
            Ok(None) => {
                std::thread::sleep(SLEEP_TIME);
            }
            Err(WorkerError::WorkerNotFound) => {
                return Err(WorkerError::WorkerNotFound);
            }
            Err(e) => {
                warn!(error = %e, "transient error popping build job, retrying");
                std::thread::sleep(SLEEP_TIME);
            }
        }
    }
}

/// Render, run, and supervise one job's build script. Returns the script's
/// own exit code and the classified status on any outcome that ran to
/// completion (including a timeout or a forced kill). Errors here are
/// everything that kept the script from producing an outcome at all: the
/// caller reports those to the coordinator as `(failed=true, status=error)`.
fn build_job(
    cfg: &Config,
    client: &Arc<CoordinatorClient>,
    job: &JobData,
    terminate: Arc<AtomicBool>,
) -> Result<(i32, &'static str)> {
    let job_id = job.job_id();

    // build_scripts/, build_data/, and build_logs/ all live directly under
    // the worker's cwd, overwritten per job and retained until the operator
    // cleans them up — they are not scratch space that should vanish with
    // the job, so none of this is a tempdir.
    let log_dir = cfg.working_dir.join("build_logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(format!("{job_id}.log"));
    let local_file = std::fs::File::create(&log_path)?;
    let transport = CoordinatorLogTransport::new(Arc::clone(client), job_id.to_string());
    let sink = Arc::new(Mutex::new(BuildLog::new(local_file, Box::new(transport), true)));

    let tarball_path = cfg.working_dir.join("build_data").join(format!("{job_id}.tar.bz2"));
    if job.git_oauth_token.is_none() {
        std::fs::create_dir_all(tarball_path.parent().expect("build_data is a parent"))?;
        let mut tarball = std::fs::File::create(&tarball_path)?;
        client.fetch_build_source(job, &mut tarball)?;
    }

    let script_path = script_gen::gen_build_script(
        &cfg.working_dir,
        job,
        ScriptTarget::host(),
        &GenOpts::default(),
    )?;

    let mut command = match ScriptTarget::host() {
        ScriptTarget::Unix => {
            let mut c = std::process::Command::new("bash");
            c.arg(&script_path);
            c
        }
        ScriptTarget::Windows => {
            let mut c = std::process::Command::new("cmd");
            c.arg("/c").arg(&script_path);
            c
        }
    };
    command.current_dir(&cfg.working_dir);
    command.arg("--api-token").arg(&job.upload_token);
    if let Some(token) = &job.git_oauth_token {
        command.arg("--git-oauth-token").arg(token);
    } else {
        command.arg("--build-tarball").arg(&tarball_path);
    }

    let iotimeout = Duration::from_secs(job.build_item_info.instructions.iotimeout());
    let outcome = supervisor::supervise(command, Arc::clone(&sink), iotimeout, terminate)?;

    sink.lock().unwrap().flush()?;

    Ok(match outcome {
        Outcome::Exited(code) => (code, classify(code)),
        Outcome::TimedOut => (supervisor::EXIT_TIMED_OUT, "error"),
        Outcome::Killed => (supervisor::EXIT_KILLED, "error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_documented_codes() {
        assert_eq!(classify(0), "success");
        assert_eq!(classify(12), "failure");
        assert_eq!(classify(11), "error");
        assert_eq!(classify(99), "error");
        assert_eq!(classify(supervisor::EXIT_TIMED_OUT), "error");
    }
}
