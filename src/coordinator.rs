//! Blocking HTTP client for the build-coordination service.
//!
//! One [`CoordinatorClient`] per worker process. Every call centralizes the
//! base URL, auth header, and request timeout so individual call sites stay
//! small; a `404` from `pop_build_job` specifically is promoted to
//! [`WorkerError::WorkerNotFound`], which the job loop treats as fatal.

use std::io::Read;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::buildlog::LogTransport;
use crate::error::{Result, WorkerError};
use crate::model::{JobData, PopBuildJobResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CoordinatorClient {
    base_url: String,
    token: String,
    agent: ureq::Agent,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(DEFAULT_TIMEOUT)
            .build();
        CoordinatorClient {
            base_url: base_url.into(),
            token: token.into(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn register_worker(
        &self,
        username: &str,
        queue: &str,
        platform: &str,
        hostname: &str,
    ) -> Result<String> {
        let mut body = Map::new();
        body.insert("platform".into(), Value::String(platform.into()));
        body.insert("hostname".into(), Value::String(hostname.into()));

        let path = format!("/api/build-queue/{username}/{queue}/workers");
        let resp: Map<String, Value> = self
            .agent
            .post(&self.url(&path))
            .set("Authorization", &self.auth_header())
            .send_json(Value::Object(body))
            .map_err(WorkerError::Transport)?
            .into_json()?;

        resp.get("worker_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| WorkerError::Config("register response missing worker_id".into()))
    }

    pub fn remove_worker(&self, username: &str, queue: &str, worker_id: &str) -> Result<()> {
        let path = format!("/api/build-queue/{username}/{queue}/workers/{worker_id}");
        self.agent
            .delete(&self.url(&path))
            .set("Authorization", &self.auth_header())
            .call()
            .map_err(WorkerError::Transport)?;
        Ok(())
    }

    /// Pop the next queued job for this worker. `None` means the queue is
    /// empty right now; a `404` means the worker itself is gone and is
    /// reported as [`WorkerError::WorkerNotFound`].
    pub fn pop_build_job(
        &self,
        username: &str,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<JobData>> {
        let path = format!("/api/build-queue/{username}/{queue}/workers/{worker_id}/jobs");
        let result = self
            .agent
            .get(&self.url(&path))
            .set("Authorization", &self.auth_header())
            .call();

        let resp = match result {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => return Err(WorkerError::WorkerNotFound),
            Err(e) => return Err(WorkerError::Transport(e)),
        };

        let body: Value = resp.into_json()?;
        let parsed: PopBuildJobResponse = serde_json::from_value(body.clone())?;
        match parsed.job {
            Some(_) => {
                let job: JobData = serde_json::from_value(body)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Stream the job's source tarball to `dest`, 8KB at a time.
    pub fn fetch_build_source(&self, job: &JobData, dest: &mut dyn std::io::Write) -> Result<u64> {
        let path = format!(
            "/api/build-item/{}/{}/source",
            job.owner.login, job.package.name
        );
        let resp = self
            .agent
            .get(&self.url(&path))
            .set("Authorization", &self.auth_header())
            .call()
            .map_err(WorkerError::Transport)?;

        let mut reader = resp.into_reader();
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    pub fn finish_build(&self, job: &JobData, failed: bool, status: &str) -> Result<()> {
        let path = format!("/api/build-queue/jobs/{}/finish", job.job_id());
        let mut body = Map::new();
        body.insert("failed".into(), Value::Bool(failed));
        body.insert("status".into(), Value::String(status.into()));

        self.agent
            .post(&self.url(&path))
            .set("Authorization", &self.auth_header())
            .send_json(Value::Object(body))
            .map_err(WorkerError::Transport)?;
        Ok(())
    }
}

/// Adapts a [`CoordinatorClient`] into the transport a
/// [`crate::buildlog::BuildLog`] flushes buffered output through.
pub struct CoordinatorLogTransport {
    client: std::sync::Arc<CoordinatorClient>,
    job_id: String,
}

impl CoordinatorLogTransport {
    pub fn new(client: std::sync::Arc<CoordinatorClient>, job_id: impl Into<String>) -> Self {
        CoordinatorLogTransport {
            client,
            job_id: job_id.into(),
        }
    }
}

fn form_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// `application/x-www-form-urlencoded` percent-encoding over raw bytes.
///
/// Build output is not guaranteed to be valid UTF-8, and the byte-identity
/// contract between the local file and what the server receives depends on
/// this round-tripping every byte unchanged — only the server's own
/// form-decode step may substitute U+FFFD for invalid sequences, never this
/// client. `ureq::send_form` takes `&str`, which would force a lossy
/// conversion first, so the body is built and posted as raw bytes instead.
fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

impl LogTransport for CoordinatorLogTransport {
    /// Posts the chunk as form-encoded `msg` plus one field per metadata
    /// key, and returns the server's own `terminated` flag from the
    /// response body (absent/non-boolean is treated as `false`).
    fn send_chunk(&mut self, chunk: &[u8], section: Option<&Map<String, Value>>) -> Result<bool> {
        let path = format!("/api/build-queue/jobs/{}/log", self.job_id);

        let mut body = String::new();
        body.push_str("msg=");
        body.push_str(&percent_encode(chunk));
        if let Some(section) = section {
            for (k, v) in section {
                body.push('&');
                body.push_str(&percent_encode(k.as_bytes()));
                body.push('=');
                body.push_str(&percent_encode(form_value(v).as_bytes()));
            }
        }

        let resp = self
            .client
            .agent
            .post(&self.client.url(&path))
            .set("Authorization", &self.client.auth_header())
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_bytes(body.as_bytes())
            .map_err(WorkerError::Transport)?;

        let body: Value = resp.into_json().unwrap_or(Value::Null);
        Ok(body.get("terminated").and_then(Value::as_bool).unwrap_or(false))
    }
}
