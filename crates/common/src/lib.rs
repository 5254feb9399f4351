use serde::{Deserialize, Serialize};

pub mod credentials;
pub mod registry;

pub use credentials::{issue_device_token, verify_device_token, AgentKeypair, DeviceClaims};
pub use registry::{Document, Fields, Filter, Registry, RegistryError};

pub const DEVICES: &str = "devices";
pub const JOBS: &str = "jobs";
pub const JOB_TASKS: &str = "jobs-tasks";
pub const DEVICE_GROUPS: &str = "deviceGroups";
pub const AGENTS: &str = "agents";

/// Package name of the managed service installed on every enrolled device.
pub const SERVICE_PACKAGE: &str = "com.leroymerlin.pandalab";

/// Error text written on tasks reclaimed by the timeout sweep.
pub const TASK_TIMEOUT_ERROR: &str = "Timeout reached";

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Join a collection path and a document id into a document reference.
pub fn doc_path(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Split a document reference into its collection path and id.
///
/// `applications/a/versions/v/artifacts/x` splits into
/// `("applications/a/versions/v/artifacts", "x")`.
pub fn split_doc_path(path: &str) -> Option<(&str, &str)> {
    let (collection, id) = path.trim_matches('/').rsplit_once('/')?;
    if collection.is_empty() || id.is_empty() {
        return None;
    }
    Some((collection, id))
}

// ===================== Devices =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Offline,
    Available,
    Running,
    Booked,
    Unavailable,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Available => write!(f, "available"),
            DeviceStatus::Running => write!(f, "running"),
            DeviceStatus::Booked => write!(f, "booked"),
            DeviceStatus::Unavailable => write!(f, "unavailable"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// `devices/{id}` as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceDoc {
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub ip: Option<String>,
    /// Reference to the owning agent, `agents/{agentId}`.
    #[serde(default)]
    pub agent: Option<String>,
}

impl DeviceDoc {
    /// Stored IP, if one is set and non-empty.
    pub fn known_ip(&self) -> Option<&str> {
        self.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())
    }
}

// ===================== Jobs & tasks =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Inprogress,
    Success,
    Failure,
    Unstable,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Inprogress => write!(f, "inprogress"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failure => write!(f, "failure"),
            JobStatus::Unstable => write!(f, "unstable"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Ignored,
    #[serde(other)]
    Unknown,
}

/// `jobs/{id}` as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDoc {
    /// Reference to the debug build artifact.
    pub apk: String,
    /// Reference to the matching test artifact.
    pub apk_test: String,
    #[serde(default)]
    pub completed: bool,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
}

/// Outcome of running the test artifact on one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRunResult {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub install_failed: bool,
    #[serde(default)]
    pub tests: Vec<TestResult>,
}

impl DeviceRunResult {
    pub fn is_failure(&self) -> bool {
        self.install_failed || self.tests.iter().any(|t| t.status != TestStatus::Pass)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskResult {
    #[serde(default)]
    pub results: Vec<DeviceRunResult>,
}

/// `jobs-tasks/{id}` as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDoc {
    /// Reference to the owning job, `jobs/{jobId}`.
    pub job: String,
    /// Candidate device identifiers; the executor picks one.
    #[serde(default)]
    pub devices: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub completed: bool,
    /// Deadline in unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskDoc {
    /// True when a successful run reported an install failure or a non-passing test.
    pub fn has_test_failure(&self) -> bool {
        self.status == TaskStatus::Success
            && self
                .result
                .as_ref()
                .map(|r| r.results.iter().any(DeviceRunResult::is_failure))
                .unwrap_or(false)
    }
}
