//! binstar-build-worker entry point.
//!
//! Three subcommands: `register` creates a worker-id against a queue and
//! exits, `worker` runs the pop/build/finish loop until killed or told to
//! stop, and `clean` removes a stale lock file left behind by a worker that
//! didn't shut down cleanly. All structured output is logs on stderr; there
//! is no JSON stdout contract here, unlike a job-inspection CLI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use binstar_build_worker::config::{Config, ConfigArgs};
use binstar_build_worker::coordinator::CoordinatorClient;
use binstar_build_worker::error::WorkerError;
use binstar_build_worker::job_loop;
use binstar_build_worker::worker_context::WorkerContext;

#[derive(Debug, Parser)]
#[command(name = "binstar-build-worker")]
#[command(about = "Registers with a build-coordination service and runs queued build jobs")]
struct Cli {
    /// Increase log verbosity: -v info, -vv debug, -vvv+ trace. Default warn.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
struct CommonArgs {
    /// Coordinator base URL. Defaults to BINSTAR_BUILD_BASE_URL or the
    /// production API.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Coordinator API token. Defaults to BINSTAR_BUILD_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Account this worker builds on behalf of.
    #[arg(long, global = true)]
    username: Option<String>,

    /// Build queue name. Defaults to "default".
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Platform string reported at registration, e.g. "linux-64".
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Hostname reported at registration. Defaults to the OS hostname.
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Working directory holding the lock file, job workspaces, and journal.
    #[arg(long, global = true)]
    cwd: Option<std::path::PathBuf>,

    /// Remove a pre-existing lock file (and deregister its worker-id)
    /// before proceeding.
    #[arg(long, global = true)]
    clean: bool,

    /// Print full error chains instead of a one-line summary.
    #[arg(long, global = true)]
    show_traceback: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a new worker-id with the coordinator and exit.
    Register,

    /// Run the pop/build/finish loop until killed.
    Worker,

    /// Remove a stale lock file left by a worker that didn't shut down
    /// cleanly, deregistering its worker-id on a best-effort basis.
    Clean,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let show_traceback = cli.common.show_traceback;
    if let Err(e) = run(cli) {
        if show_traceback {
            error!("{e:#?}");
        } else {
            error!("{e}");
        }
        std::process::exit(1);
    }
}

fn build_config(common: CommonArgs) -> anyhow::Result<Config> {
    let args = ConfigArgs {
        base_url: common.base_url,
        token: common.token,
        username: common.username,
        queue: common.queue,
        platform: common.platform,
        hostname: common.hostname,
        working_dir: common.cwd,
        clean: common.clean,
        show_traceback: common.show_traceback,
    };
    Ok(Config::resolve(args)?)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = build_config(cli.common)?;
    let client = Arc::new(CoordinatorClient::new(cfg.base_url.clone(), cfg.token.clone()));

    match cli.command {
        Command::Register => {
            let worker_id = WorkerContext::register_only(
                &client,
                &cfg.username,
                &cfg.queue,
                &cfg.platform,
                &cfg.hostname,
            )?;
            println!("{worker_id}");
        }

        Command::Worker => {
            let ctx = WorkerContext::acquire(
                &cfg.working_dir,
                &client,
                &cfg.username,
                &cfg.queue,
                &cfg.platform,
                &cfg.hostname,
                cfg.clean,
            )?;

            let terminate = Arc::new(AtomicBool::new(false));
            install_signal_handler(Arc::clone(&terminate));

            let result = job_loop::work_forever(&cfg, &client, &ctx, terminate);
            ctx.release(&client);

            match result {
                Ok(()) => {}
                Err(WorkerError::WorkerNotFound) => {
                    anyhow::bail!(WorkerError::WorkerNotFound);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Command::Clean => {
            WorkerContext::clean_stale_lock(&cfg.working_dir, &client)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

/// Install a SIGTERM/SIGINT handler (Unix only) that flips `terminate` so
/// the job loop and the active supervisor both notice on their next poll.
fn install_signal_handler(terminate: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
            libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
        }
        std::thread::spawn(move || loop {
            if SIGNAL_RECEIVED.load(Ordering::SeqCst) {
                terminate.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        });
    }
    #[cfg(not(unix))]
    {
        let _ = terminate;
    }
}
