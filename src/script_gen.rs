//! Renders a job descriptor into an executable build script.
//!
//! The script's own exit code is the outcome contract described in the
//! design doc: `0` success, `11` error, `12` failure, anything else treated
//! as an unknown error by the job loop. The bodies of the individual
//! preamble sections (fetching sources, setting up the build environment)
//! are templated only up to that contract; the real substance is the
//! job's own `instructions`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::Result;
use crate::model::JobData;

/// Which flavor of script to render. Defaults to the host platform the
/// worker itself is running on; exposed so tests can force either branch
/// regardless of the machine actually running them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTarget {
    Unix,
    Windows,
}

impl ScriptTarget {
    pub fn host() -> Self {
        if cfg!(windows) {
            ScriptTarget::Windows
        } else {
            ScriptTarget::Unix
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScriptTarget::Unix => "sh",
            ScriptTarget::Windows => "bat",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenOpts {
    /// Omit the conda-environment setup preamble (used by pre-staged runs
    /// and by tests that only care about the instruction phases).
    pub ignore_setup_build: bool,
    /// Omit the source-fetch preamble (`--git-oauth-token` / `--build-tarball`
    /// handling entirely).
    pub ignore_fetch_build_source: bool,
}

/// Render `job` into a script under `build_scripts/<job_id>.(sh|bat)` inside
/// `working_dir`, creating the directory if needed, and return the path.
pub fn gen_build_script(
    working_dir: &Path,
    job: &JobData,
    target: ScriptTarget,
    opts: &GenOpts,
) -> Result<PathBuf> {
    let scripts_dir = working_dir.join("build_scripts");
    std::fs::create_dir_all(&scripts_dir)?;

    let body = match target {
        ScriptTarget::Unix => render_unix(job, working_dir, opts),
        ScriptTarget::Windows => render_windows(job, working_dir, opts),
    };

    let path = scripts_dir.join(format!("{}.{}", job.job_id(), target.extension()));
    std::fs::write(&path, body)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

/// Extract `XY` (digits only, decimal point stripped) from an engine string
/// of the form `numpy=X.Y`, if present.
fn conda_npy(engine: &str) -> Option<String> {
    let rest = engine.strip_prefix("numpy=")?;
    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

/// Channels to pass as `--label <channel>` on the upload command: prefer
/// `instructions.build_targets.channels`, fall back to `build_info.channels`.
fn upload_channels(job: &JobData) -> Vec<String> {
    if let Some(bt) = &job.build_item_info.instructions.build_targets
        && !bt.channels.is_empty()
    {
        return bt.channels.clone();
    }
    job.build_info.channels.clone()
}

/// Neutralize conda invocations that would install/update into the root
/// environment.
///
/// A line is suspect iff it contains the standalone token `conda`, an
/// `install` or `update` subcommand, and a whitespace-delimited `-n root`
/// or `--name root`. Everything else — including leading/trailing
/// whitespace on non-suspect lines — passes through unchanged.
pub fn remove_conda_n_root(line: &str) -> String {
    static HAS_CONDA: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    static HAS_SUBCOMMAND: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    static HAS_ROOT_FLAG: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

    let has_conda = HAS_CONDA.get_or_init(|| Regex::new(r"\bconda\b").unwrap());
    let has_subcommand =
        HAS_SUBCOMMAND.get_or_init(|| Regex::new(r"\b(?:install|update)\b").unwrap());
    let has_root_flag = HAS_ROOT_FLAG
        .get_or_init(|| Regex::new(r"(?:^|\s)(?:-n|--name)\s+root(?:\s|$)").unwrap());

    let suspect = has_conda.is_match(line)
        && has_subcommand.is_match(line)
        && has_root_flag.is_match(line);

    if !suspect {
        return line.to_string();
    }

    format!(
        "echo \"NOT RUNNING: {}\"",
        line.trim().replace('"', "'")
    )
}

fn filtered_instruction(cmd: &Option<String>) -> Option<String> {
    cmd.as_deref().map(remove_conda_n_root)
}

fn render_unix(job: &JobData, working_dir: &Path, opts: &GenOpts) -> String {
    let instr = &job.build_item_info.instructions;
    let env = job.build_item_info.merged_env();
    let channels = upload_channels(job);

    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/bash");
    let _ = writeln!(s, "# Generated build script for job {}", job.job_id());

    if let Some(npy) = conda_npy(&job.build_item_info.engine) {
        let _ = writeln!(s, "export CONDA_NPY={npy}");
    }

    let _ = writeln!(s, "WORKING_DIR={}", shell_quote(&working_dir.display().to_string()));
    let _ = writeln!(s, "BUILD_ENV_PATH=\"${{WORKING_DIR}}/env\"");

    for (k, v) in &env {
        let _ = writeln!(s, "export {}={}", k, shell_quote(v));
    }

    let _ = writeln!(s, "API_TOKEN=\"\"");
    let _ = writeln!(s, "GIT_OAUTH_TOKEN=\"\"");
    let _ = writeln!(s, "BUILD_TARBALL=\"\"");
    let _ = writeln!(s, "while [ $# -gt 0 ]; do");
    let _ = writeln!(s, "  case \"$1\" in");
    let _ = writeln!(s, "    --api-token) API_TOKEN=\"$2\"; shift 2;;");
    let _ = writeln!(s, "    --git-oauth-token) GIT_OAUTH_TOKEN=\"$2\"; shift 2;;");
    let _ = writeln!(s, "    --build-tarball) BUILD_TARBALL=\"$2\"; shift 2;;");
    let _ = writeln!(s, "    *) shift;;");
    let _ = writeln!(s, "  esac");
    let _ = writeln!(s, "done");

    if !opts.ignore_fetch_build_source {
        let _ = writeln!(s, "if [ -n \"$GIT_OAUTH_TOKEN\" ]; then");
        let _ = writeln!(s, "  echo \"Fetching source via git\"");
        let _ = writeln!(s, "elif [ -n \"$BUILD_TARBALL\" ]; then");
        let _ = writeln!(s, "  if [ ! -f \"$BUILD_TARBALL\" ]; then");
        let _ = writeln!(s, "    echo \"build tarball not found: $BUILD_TARBALL\"");
        let _ = writeln!(s, "    echo \"Exit BINSTAR_BUILD_RESULT=error\"");
        let _ = writeln!(s, "    exit 11");
        let _ = writeln!(s, "  fi");
        let _ = writeln!(s, "  echo \"Extracting source tarball $BUILD_TARBALL\"");
        let _ = writeln!(s, "else");
        let _ = writeln!(s, "  echo \"neither --git-oauth-token nor --build-tarball supplied\"");
        let _ = writeln!(s, "  echo \"Exit BINSTAR_BUILD_RESULT=error\"");
        let _ = writeln!(s, "  exit 11");
        let _ = writeln!(s, "fi");
    }

    if !opts.ignore_setup_build {
        let _ = writeln!(s, "echo \"Setting up build environment at $BUILD_ENV_PATH\"");
    }

    let label_args: String = channels
        .iter()
        .map(|c| format!("--label {c}"))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(s, "UPLOAD_ARGS=\"{label_args}\"");

    let _ = writeln!(s, "fail() {{");
    let _ = writeln!(s, "  echo \"Exit BINSTAR_BUILD_RESULT=$1\"");
    let _ = writeln!(s, "  exit \"$2\"");
    let _ = writeln!(s, "}}");

    if let Some(cmd) = filtered_instruction(&instr.install) {
        let _ = writeln!(s, "if ! {{ {cmd} ; }}; then");
        if let Some(after_error) = filtered_instruction(&instr.after_error) {
            let _ = writeln!(s, "  {after_error}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  {after_script}");
        }
        let _ = writeln!(s, "  fail error 11");
        let _ = writeln!(s, "fi");
    }

    if let Some(cmd) = filtered_instruction(&instr.test) {
        let _ = writeln!(s, "if ! {{ {cmd} ; }}; then");
        if let Some(after_failure) = filtered_instruction(&instr.after_failure) {
            let _ = writeln!(s, "  {after_failure}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  {after_script}");
        }
        let _ = writeln!(s, "  fail failure 12");
        let _ = writeln!(s, "fi");
    }

    if let Some(cmd) = filtered_instruction(&instr.before_script) {
        let _ = writeln!(s, "{cmd}");
    }

    if let Some(cmd) = filtered_instruction(&instr.script) {
        let _ = writeln!(s, "if ! {{ {cmd} ; }}; then");
        if let Some(after_failure) = filtered_instruction(&instr.after_failure) {
            let _ = writeln!(s, "  {after_failure}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  {after_script}");
        }
        let _ = writeln!(s, "  fail failure 12");
        let _ = writeln!(s, "fi");
    }

    if let Some(after_success) = filtered_instruction(&instr.after_success) {
        let _ = writeln!(s, "{after_success}");
    }
    if channels.iter().next().is_some() || instr.build_targets.is_some() {
        let _ = writeln!(s, "echo \"anaconda upload $UPLOAD_ARGS\"");
    }
    if let Some(after_script) = filtered_instruction(&instr.after_script) {
        let _ = writeln!(s, "{after_script}");
    }

    let _ = writeln!(s, "fail success 0");
    s
}

fn render_windows(job: &JobData, working_dir: &Path, opts: &GenOpts) -> String {
    let instr = &job.build_item_info.instructions;
    let env = job.build_item_info.merged_env();
    let channels = upload_channels(job);

    let mut s = String::new();
    let _ = writeln!(s, "@echo off");
    let _ = writeln!(s, "setlocal enabledelayedexpansion");
    let _ = writeln!(s, "rem Generated build script for job {}", job.job_id());

    if let Some(npy) = conda_npy(&job.build_item_info.engine) {
        let _ = writeln!(s, "set CONDA_NPY={npy}");
    }

    let _ = writeln!(s, "set WORKING_DIR={}", working_dir.display());
    let _ = writeln!(s, "set BUILD_ENV_PATH=\"%WORKING_DIR%\\env\"");

    for (k, v) in &env {
        let _ = writeln!(s, "set {k}={v}");
    }

    let _ = writeln!(s, "set API_TOKEN=");
    let _ = writeln!(s, "set GIT_OAUTH_TOKEN=");
    let _ = writeln!(s, "set BUILD_TARBALL=");
    let _ = writeln!(s, ":parse_args");
    let _ = writeln!(s, "if \"%~1\"==\"\" goto args_done");
    let _ = writeln!(s, "if \"%~1\"==\"--api-token\" (set API_TOKEN=%~2& shift & shift & goto parse_args)");
    let _ = writeln!(
        s,
        "if \"%~1\"==\"--git-oauth-token\" (set GIT_OAUTH_TOKEN=%~2& shift & shift & goto parse_args)"
    );
    let _ = writeln!(
        s,
        "if \"%~1\"==\"--build-tarball\" (set BUILD_TARBALL=%~2& shift & shift & goto parse_args)"
    );
    let _ = writeln!(s, "shift");
    let _ = writeln!(s, "goto parse_args");
    let _ = writeln!(s, ":args_done");

    if !opts.ignore_fetch_build_source {
        let _ = writeln!(s, "if not \"%GIT_OAUTH_TOKEN%\"==\"\" (");
        let _ = writeln!(s, "  echo Fetching source via git");
        let _ = writeln!(s, ") else if not \"%BUILD_TARBALL%\"==\"\" (");
        let _ = writeln!(s, "  if not exist \"%BUILD_TARBALL%\" (");
        let _ = writeln!(s, "    echo build tarball not found: %BUILD_TARBALL%");
        let _ = writeln!(s, "    echo Exit BINSTAR_BUILD_RESULT=error");
        let _ = writeln!(s, "    exit /b 11");
        let _ = writeln!(s, "  )");
        let _ = writeln!(s, "  echo Extracting source tarball %BUILD_TARBALL%");
        let _ = writeln!(s, ") else (");
        let _ = writeln!(s, "  echo neither --git-oauth-token nor --build-tarball supplied");
        let _ = writeln!(s, "  echo Exit BINSTAR_BUILD_RESULT=error");
        let _ = writeln!(s, "  exit /b 11");
        let _ = writeln!(s, ")");
    }

    if !opts.ignore_setup_build {
        let _ = writeln!(s, "echo Setting up build environment at %BUILD_ENV_PATH%");
    }

    let label_args: String = channels
        .iter()
        .map(|c| format!("--label {c}"))
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(s, "set UPLOAD_ARGS={label_args}");

    if let Some(cmd) = filtered_instruction(&instr.install) {
        let _ = writeln!(s, "call {cmd}");
        let _ = writeln!(s, "if errorlevel 1 (");
        if let Some(after_error) = filtered_instruction(&instr.after_error) {
            let _ = writeln!(s, "  call {after_error}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  call {after_script}");
        }
        let _ = writeln!(s, "  echo Exit BINSTAR_BUILD_RESULT=error");
        let _ = writeln!(s, "  exit /b 11");
        let _ = writeln!(s, ")");
    }

    if let Some(cmd) = filtered_instruction(&instr.test) {
        let _ = writeln!(s, "call {cmd}");
        let _ = writeln!(s, "if errorlevel 1 (");
        if let Some(after_failure) = filtered_instruction(&instr.after_failure) {
            let _ = writeln!(s, "  call {after_failure}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  call {after_script}");
        }
        let _ = writeln!(s, "  echo Exit BINSTAR_BUILD_RESULT=failure");
        let _ = writeln!(s, "  exit /b 12");
        let _ = writeln!(s, ")");
    }

    if let Some(cmd) = filtered_instruction(&instr.before_script) {
        let _ = writeln!(s, "call {cmd}");
    }

    if let Some(cmd) = filtered_instruction(&instr.script) {
        let _ = writeln!(s, "call {cmd}");
        let _ = writeln!(s, "if errorlevel 1 (");
        if let Some(after_failure) = filtered_instruction(&instr.after_failure) {
            let _ = writeln!(s, "  call {after_failure}");
        }
        if let Some(after_script) = filtered_instruction(&instr.after_script) {
            let _ = writeln!(s, "  call {after_script}");
        }
        let _ = writeln!(s, "  echo Exit BINSTAR_BUILD_RESULT=failure");
        let _ = writeln!(s, "  exit /b 12");
        let _ = writeln!(s, ")");
    }

    if let Some(after_success) = filtered_instruction(&instr.after_success) {
        let _ = writeln!(s, "call {after_success}");
    }
    if channels.iter().next().is_some() || instr.build_targets.is_some() {
        let _ = writeln!(s, "echo anaconda upload %UPLOAD_ARGS%");
    }
    if let Some(after_script) = filtered_instruction(&instr.after_script) {
        let _ = writeln!(s, "call {after_script}");
    }

    let _ = writeln!(s, "echo Exit BINSTAR_BUILD_RESULT=success");
    let _ = writeln!(s, "exit /b 0");
    s
}

fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conda_npy_strips_decimal() {
        assert_eq!(conda_npy("numpy=1.9").as_deref(), Some("19"));
        assert_eq!(conda_npy("python"), None);
    }

    const OK_LINES: &[&str] = &[
        "conda install -n myenv numpy scipy scikit-learn",
        "conda update -n otherenv r",
        "/path/to/conda --debug update anaconda-client",
        "conda update numpy -n rootlikename",
        "conda install abc def ghi -n rootlike",
        "conda --debug update r-root",
        "conda install root",
        "conda env list -n root",
        "conda env list",
        "conda env list -n rootlike",
        "conda --debug install numpy",
        "conda update conda",
        "conda update conda-build",
        "conda install anaconda-client",
        "conda install roottools",
        "conda info",
        "someothercommand -n root",
    ];

    const BAD_LINES: &[&str] = &[
        "conda --debug update -n root conda",
        " conda    --debug    update     -n     root    conda  ",
        "conda install something -n root",
        "conda --debug install conda-build -n root",
        "/path/to/conda   --debug    install    conda-build   -n   root  ",
        "conda install -c abc/def -n root conda-build conda",
        " conda update -c http://domain.com/path -n root",
        "/path/to/conda --debug update abc def ghi -n root",
        "conda install abc def ghi -n root",
    ];

    #[test]
    fn ok_lines_pass_through_unchanged() {
        for line in OK_LINES {
            assert_eq!(remove_conda_n_root(line), *line);
            let padded = format!("  {line}  ");
            assert_eq!(remove_conda_n_root(&padded), padded);
        }
    }

    #[test]
    fn bad_lines_are_neutralized() {
        for line in BAD_LINES {
            assert!(remove_conda_n_root(line).contains("NOT RUNNING"));
            let renamed = line.replace("-n", "--name");
            assert!(remove_conda_n_root(&renamed).contains("NOT RUNNING"));
        }
    }

    #[test]
    fn filter_is_idempotent() {
        for line in OK_LINES.iter().chain(BAD_LINES.iter()) {
            let once = remove_conda_n_root(line);
            let twice = remove_conda_n_root(&once);
            assert_eq!(once, twice);
        }
    }

    fn default_job() -> JobData {
        use crate::model::*;
        JobData {
            job: JobEnvelope { id: "test_gen_build_script".into() },
            job_name: "job".into(),
            build_info: BuildInfo { build_no: None, channels: vec![] },
            build_item_info: BuildItemInfo {
                platform: "linux-64".into(),
                engine: "python".into(),
                instructions: Instructions {
                    install: Some("echo UNIQUE INSTALL MARKER".into()),
                    test: Some("echo UNIQUE TEST MARKER".into()),
                    before_script: Some("echo UNIQUE BEFORE SCRIPT MARKER".into()),
                    script: Some("echo UNIQUE SCRIPT MARKER".into()),
                    after_failure: Some("echo UNIQUE AFTER FAILURE MARKER".into()),
                    after_error: Some("echo UNIQUE AFTER ERROR MARKER".into()),
                    after_success: Some("echo UNIQUE AFTER SUCCESS MARKER".into()),
                    after_script: Some("echo UNIQUE AFTER SCRIPT MARKER".into()),
                    iotimeout: None,
                    build_targets: None,
                },
                env: Default::default(),
                envvars: Default::default(),
            },
            upload_token: "tok".into(),
            git_oauth_token: None,
            owner: Owner { login: "me".into() },
            package: Package { name: "the_package".into() },
        }
    }

    #[test]
    fn working_dir_quoting_matches_platform() {
        let job = default_job();
        let tmp = tempfile::tempdir().unwrap();
        let unix = render_unix(&job, tmp.path(), &GenOpts::default());
        assert!(unix.contains("BUILD_ENV_PATH=\"${WORKING_DIR}/env\""));
        let win = render_windows(&job, tmp.path(), &GenOpts::default());
        assert!(win.contains("BUILD_ENV_PATH=\"%WORKING_DIR%\\env\""));
    }

    #[test]
    fn channels_produce_label_flags() {
        use crate::model::BuildTargets;
        let mut job = default_job();
        job.build_item_info.instructions.build_targets = Some(BuildTargets {
            files: Some("output_file".into()),
            channels: vec!["foo".into()],
        });
        let tmp = tempfile::tempdir().unwrap();
        let script = render_unix(&job, tmp.path(), &GenOpts::default());
        assert!(script.contains("--label foo"));
    }

    #[test]
    fn build_info_channels_are_fallback() {
        use crate::model::BuildTargets;
        let mut job = default_job();
        job.build_info.channels = vec!["foo".into()];
        job.build_item_info.instructions.build_targets = Some(BuildTargets {
            files: Some("output_file".into()),
            channels: vec![],
        });
        let tmp = tempfile::tempdir().unwrap();
        let script = render_unix(&job, tmp.path(), &GenOpts::default());
        assert!(script.contains("--label foo"));
    }

    #[test]
    fn conda_npy_exported_at_top() {
        let mut job = default_job();
        job.build_item_info.engine = "numpy=1.9".into();
        let tmp = tempfile::tempdir().unwrap();
        let script = render_unix(&job, tmp.path(), &GenOpts::default());
        let first_npy_line = script
            .lines()
            .find(|l| l.contains("CONDA_NPY"))
            .expect("CONDA_NPY present");
        assert!(first_npy_line.trim_start().starts_with("export"));
        assert!(first_npy_line.contains("=19"));
    }

    #[test]
    fn env_and_envvars_both_recognized() {
        for field_is_env in [true, false] {
            let mut job = default_job();
            if field_is_env {
                job.build_item_info
                    .env
                    .insert("ENVIRONMENT_VARIABLE".into(), "1".into());
            } else {
                job.build_item_info
                    .envvars
                    .insert("ENVIRONMENT_VARIABLE".into(), "1".into());
            }
            let tmp = tempfile::tempdir().unwrap();
            let script = render_unix(&job, tmp.path(), &GenOpts::default());
            assert!(script.contains("ENVIRONMENT_VARIABLE="));
        }
    }

    #[test]
    fn gen_build_script_writes_executable_file() {
        let job = default_job();
        let tmp = tempfile::tempdir().unwrap();
        let path = gen_build_script(tmp.path(), &job, ScriptTarget::Unix, &GenOpts {
            ignore_setup_build: true,
            ignore_fetch_build_source: true,
        })
        .unwrap();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "sh");
    }
}
