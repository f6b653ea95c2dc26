use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Application names double as container names and subdomain labels, so the
/// pattern is strict: bounded length, leading letter, no characters that
/// could smuggle reverse-proxy directives into the config file.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{2,19}$").expect("valid name pattern"));

pub const MAX_DESCRIPTION_LEN: usize = 100;

pub fn valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub app_id: String,
    /// Stable small integer assigned at registration, used for host port
    /// derivation. Unique ids guarantee collision-free ports.
    pub numeric_id: u16,
    pub name: String,
    pub description: String,
    pub user_id: String,
    pub deleted: bool,
    pub repo: Repo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn host_port(&self, base_port: u16) -> u16 {
        base_port + self.numeric_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub git_url: String,
    #[serde(default)]
    pub private: bool,
}

/// Registration request, before the store assigns ids and timestamps.
#[derive(Debug, Clone, Deserialize)]
pub struct NewApp {
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub repo: Repo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppPatch {
    pub description: Option<String>,
    pub repo: Option<Repo>,
}

/// Normalized build manifest, after validation. `base_image` is the concrete
/// image the declared runtime resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub base_image: String,
    /// Start command steps, joined into the container CMD.
    pub web: Vec<String>,
    /// Build steps executed while assembling the image.
    pub run: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Building,
    SettingUp,
    Success,
    Failed,
}

impl BuildStatus {
    /// Numeric code sent over the websocket status channel.
    pub fn code(self) -> u8 {
        match self {
            BuildStatus::Building => 0,
            BuildStatus::SettingUp => 1,
            BuildStatus::Success => 2,
            BuildStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }
}

/// Code answered when the queried build id has no attempt yet.
pub const UNKNOWN_BUILD_CODE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    Build,
    Run,
}

/// One build or run attempt. Created on the first log write for its id and
/// only ever appended to afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub build_id: String,
    pub logs: Vec<String>,
    pub status: BuildStatus,
    pub kind: LogKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildAttempt {
    pub fn new(build_id: &str, kind: LogKind) -> Self {
        let now = Utc::now();
        BuildAttempt {
            build_id: build_id.to_string(),
            logs: Vec::new(),
            status: BuildStatus::Building,
            kind,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Observable container state as reported by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

/// Application state exposed to status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppState {
    NotBuilt,
    NotRunning,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub build_id: String,
    pub status: BuildStatus,
    pub kind: LogKind,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

impl AttemptSummary {
    pub fn from_attempt(attempt: &BuildAttempt, include_logs: bool) -> Self {
        AttemptSummary {
            build_id: attempt.build_id.clone(),
            status: attempt.status,
            kind: attempt.kind,
            created_at: attempt.created_at,
            logs: include_logs.then(|| attempt.logs.clone()),
        }
    }
}

/// Answer to a status query. Never fails merely because a build or run is in
/// flight; it reflects the latest known state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub name: String,
    pub state: AppState,
    pub latest: Option<AttemptSummary>,
    pub history: Vec<AttemptSummary>,
}
