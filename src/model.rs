//! Job descriptor and related wire types.
//!
//! These mirror the JSON shape returned by the coordinator's `pop_build_job`
//! endpoint. Only the fields the worker actually reads are modeled; anything
//! else in the payload is ignored by `serde` (no `deny_unknown_fields`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default I/O inactivity timeout, in seconds, when the job doesn't specify one.
pub const DEFAULT_IOTIMEOUT: u64 = 300;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PopBuildJobResponse {
    pub job: Option<JobEnvelope>,
    #[serde(default)]
    pub job_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEnvelope {
    #[serde(rename = "_id")]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobData {
    pub job: JobEnvelope,
    pub job_name: String,
    pub build_info: BuildInfo,
    pub build_item_info: BuildItemInfo,
    pub upload_token: String,
    #[serde(default)]
    pub git_oauth_token: Option<String>,
    pub owner: Owner,
    pub package: Package,
}

impl JobData {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub build_no: Option<serde_json::Value>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildItemInfo {
    pub platform: String,
    pub engine: String,
    pub instructions: Instructions,
    /// `env` and `envvars` are synonyms; both are folded into this field by
    /// a custom deserializer-free merge performed right after parsing — see
    /// [`BuildItemInfo::merged_env`].
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub envvars: BTreeMap<String, String>,
}

impl BuildItemInfo {
    /// `env` and `envvars` are accepted spellings for the same thing; when
    /// both are present, `env` wins for keys they share.
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.envvars.clone();
        merged.extend(self.env.clone());
        merged
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Instructions {
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub before_script: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub after_failure: Option<String>,
    #[serde(default)]
    pub after_error: Option<String>,
    #[serde(default)]
    pub after_success: Option<String>,
    #[serde(default)]
    pub after_script: Option<String>,
    #[serde(default)]
    pub iotimeout: Option<u64>,
    #[serde(default)]
    pub build_targets: Option<BuildTargets>,
}

impl Instructions {
    pub fn iotimeout(&self) -> u64 {
        self.iotimeout.unwrap_or(DEFAULT_IOTIMEOUT)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildTargets {
    #[serde(default)]
    pub files: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Package {
    pub name: String,
}
