//! Configuration resolution: CLI flags override `BINSTAR_BUILD_*`
//! environment variables, which override built-in defaults. Resolution
//! happens once, at startup, into an immutable [`Config`] passed by
//! reference from then on.

use std::path::PathBuf;

use crate::error::{Result, WorkerError};

const DEFAULT_BASE_URL: &str = "https://api.anaconda.org";
const DEFAULT_QUEUE: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub token: String,
    pub username: String,
    pub queue: String,
    pub platform: String,
    pub hostname: String,
    pub working_dir: PathBuf,
    pub clean: bool,
    pub show_traceback: bool,
}

/// Inputs gathered from `clap` before environment/default resolution.
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub queue: Option<String>,
    pub platform: Option<String>,
    pub hostname: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub clean: bool,
    pub show_traceback: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn resolve(args: ConfigArgs) -> Result<Self> {
        let base_url = args
            .base_url
            .or_else(|| env_var("BINSTAR_BUILD_BASE_URL"))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let token = args
            .token
            .or_else(|| env_var("BINSTAR_BUILD_TOKEN"))
            .ok_or_else(|| WorkerError::Config("no coordinator token given (--token or BINSTAR_BUILD_TOKEN)".into()))?;

        let username = args
            .username
            .or_else(|| env_var("BINSTAR_BUILD_USERNAME"))
            .ok_or_else(|| WorkerError::Config("no username given (--username or BINSTAR_BUILD_USERNAME)".into()))?;

        let queue = args
            .queue
            .or_else(|| env_var("BINSTAR_BUILD_QUEUE"))
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        let platform = args
            .platform
            .or_else(|| env_var("BINSTAR_BUILD_PLATFORM"))
            .unwrap_or_else(default_platform);

        let hostname = args
            .hostname
            .or_else(|| env_var("BINSTAR_BUILD_HOSTNAME"))
            .or_else(|| hostname_from_os())
            .unwrap_or_else(|| "unknown-host".to_string());

        let working_dir = args
            .working_dir
            .or_else(|| env_var("BINSTAR_BUILD_CWD").map(PathBuf::from))
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map_err(WorkerError::from))?;

        Ok(Config {
            base_url,
            token,
            username,
            queue,
            platform,
            hostname,
            working_dir,
            clean: args.clean,
            show_traceback: args.show_traceback,
        })
    }
}

fn default_platform() -> String {
    let os = if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    };
    let arch = if cfg!(target_pointer_width = "64") { "64" } else { "32" };
    format!("{os}-{arch}")
}

fn hostname_from_os() -> Option<String> {
    #[cfg(unix)]
    {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
    #[cfg(not(unix))]
    {
        env_var("COMPUTERNAME")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_a_config_error() {
        let args = ConfigArgs {
            username: Some("alice".into()),
            ..Default::default()
        };
        // SAFETY-free: just clears a var this process owns for the test.
        unsafe { std::env::remove_var("BINSTAR_BUILD_TOKEN") };
        let err = Config::resolve(args).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn defaults_fill_in_base_url_and_queue() {
        let args = ConfigArgs {
            token: Some("t".into()),
            username: Some("alice".into()),
            ..Default::default()
        };
        let cfg = Config::resolve(args).unwrap();
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.queue, DEFAULT_QUEUE);
    }
}
