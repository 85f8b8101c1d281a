use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Models the inference image knows how to run. `model` is kept a free
/// string in the schema so that an out-of-set value reaches the controller
/// and is reported on the resource status instead of being rejected at
/// admission.
pub const ALLOWED_MODELS: &[&str] = &["resnet50", "mobilenet_v3_small"];

/// Directory inside the compute pod where the artifact volume is mounted.
pub const ARTIFACT_MOUNT_PATH: &str = "/artifacts";

pub const APP_LABEL_KEY: &str = "app";
pub const APP_LABEL_VALUE: &str = "gpu-job";
pub const JOB_LABEL_KEY: &str = "ephemeralaccelerationjob";

/// Name of the compute pod derived from the job name. Part of the contract
/// with external tooling; do not change.
pub fn pod_name_for(job_name: &str) -> String {
    format!("ephemeralaccelerationjob-{job_name}")
}

/// Name of the artifact volume claim derived from the job name. Part of the
/// contract with external tooling; do not change.
pub fn pvc_name_for(job_name: &str) -> String {
    format!("artifacts-{job_name}")
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ArtifactLocation {
    /// Absolute path under the artifact volume mount.
    pub path: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct GpuResources {
    /// Number of GPU devices requested for the inference container.
    #[serde(default = "default_gpu_count")]
    pub gpu: i64,
}

impl Default for GpuResources {
    fn default() -> Self {
        Self {
            gpu: default_gpu_count(),
        }
    }
}

fn default_gpu_count() -> i64 {
    1
}

fn default_model() -> String {
    "resnet50".to_string()
}

fn default_input() -> ArtifactLocation {
    ArtifactLocation {
        path: format!("{ARTIFACT_MOUNT_PATH}/input.jpg"),
    }
}

fn default_output() -> ArtifactLocation {
    ArtifactLocation {
        path: format!("{ARTIFACT_MOUNT_PATH}/output.json"),
    }
}

fn default_image() -> String {
    "gpu-job-inference:latest".to_string()
}

fn default_storage_class() -> String {
    "local-path".to_string()
}

fn default_pvc_size() -> String {
    "1Gi".to_string()
}

fn default_pvc_ttl_seconds() -> i64 {
    3600
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "gpu.yourdomain.io",
    version = "v1alpha1",
    kind = "EphemeralAccelerationJob",
    plural = "ephemeralaccelerationjobs",
    derive = "PartialEq",
    status = "EphemeralAccelerationJobStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralAccelerationJobSpec {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_input")]
    pub input: ArtifactLocation,

    #[serde(default = "default_output")]
    pub output: ArtifactLocation,

    #[serde(default)]
    pub resources: GpuResources,

    /// Container image running the inference workload.
    #[serde(default = "default_image")]
    pub image: String,

    /// Overrides the image entrypoint; the `--model/--input/--output`
    /// argument vector is appended either way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    #[serde(default = "default_pvc_size")]
    pub pvc_size: String,

    /// Seconds to keep the compute pod after the job finishes. Zero deletes
    /// it at the terminal transition.
    #[serde(default)]
    pub ttl_seconds_after_finished: i64,

    /// Seconds to keep the artifact volume after the job finishes. Zero
    /// deletes it at the terminal transition.
    #[serde(
        default = "default_pvc_ttl_seconds",
        rename = "pvcTTLSecondsAfterFinished"
    )]
    pub pvc_ttl_seconds_after_finished: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralAccelerationJobStatus {
    pub phase: JobPhase,
    pub started_at: Option<Time>,
    pub finished_at: Option<Time>,
    pub pod_name: Option<String>,
    pub artifact_path: Option<String>,
    pub message: Option<String>,
    pub last_updated: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum JobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobPhase {
    /// Succeeded and Failed are absorbing; the controller never transitions
    /// out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl FromStr for JobPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(JobPhase::Pending),
            "Running" => Ok(JobPhase::Running),
            "Succeeded" => Ok(JobPhase::Succeeded),
            "Failed" => Ok(JobPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Succeeded => write!(f, "Succeeded"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}
