use super::templates;
use crate::cluster::ClusterAccess;
use crate::util::Error;
use gpujob_types::*;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::api::Resource;

/// How much of a failed pod's output survives into the status message.
const LOG_TAIL_LINES: i64 = 20;
const LOG_TAIL_BYTES: usize = 500;

fn instance_name(instance: &EphemeralAccelerationJob) -> Result<&str, Error> {
    instance.meta().name.as_deref().ok_or_else(|| {
        Error::UserInput("EphemeralAccelerationJob is missing metadata.name".to_string())
    })
}

fn instance_namespace(instance: &EphemeralAccelerationJob) -> Result<&str, Error> {
    instance.meta().namespace.as_deref().ok_or_else(|| {
        Error::UserInput("EphemeralAccelerationJob is missing metadata.namespace".to_string())
    })
}

/// Status mutation computed by the write phase. The reconcile loop applies
/// it through the status subresource; fields left `None` keep their
/// observed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub phase: Option<JobPhase>,
    pub started_at: Option<Time>,
    pub finished_at: Option<Time>,
    pub pod_name: Option<String>,
    pub artifact_path: Option<String>,
    pub message: Option<String>,
}

impl StatusUpdate {
    pub fn apply(&self, status: &mut EphemeralAccelerationJobStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(started_at) = &self.started_at {
            status.started_at = Some(started_at.clone());
        }
        if let Some(finished_at) = &self.finished_at {
            status.finished_at = Some(finished_at.clone());
        }
        if let Some(pod_name) = &self.pod_name {
            status.pod_name = Some(pod_name.clone());
        }
        if let Some(artifact_path) = &self.artifact_path {
            status.artifact_path = Some(artifact_path.clone());
        }
        if let Some(message) = &self.message {
            status.message = Some(message.clone());
        }
    }
}

/// Makes sure the artifact claim exists. An existing claim without owner
/// references gets them patched in (claims created by external tooling
/// before the job uid was known); populated references are never
/// overwritten.
pub async fn ensure_pvc(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let name = pvc_name_for(instance_name(instance)?);
    match cluster.get_pvc(namespace, &name).await? {
        Some(existing) => {
            let missing_owner = existing
                .metadata
                .owner_references
                .as_ref()
                .is_none_or(|refs| refs.is_empty());
            if missing_owner && let Some(reference) = templates::owner_reference(instance, false) {
                cluster.patch_pvc_owner(namespace, &name, &reference).await?;
                println!("Adopted existing PVC '{}'", name);
            }
            Ok(())
        }
        None => {
            let pvc = templates::pvc_resource(instance);
            cluster.create_pvc(namespace, &pvc).await
        }
    }
}

/// Makes sure the compute pod exists; a create racing another writer is
/// treated as present by the adapter.
pub async fn ensure_pod(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
) -> Result<(), Error> {
    let namespace = instance_namespace(instance)?;
    let name = pod_name_for(instance_name(instance)?);
    if cluster.get_pod(namespace, &name).await?.is_some() {
        return Ok(());
    }
    let pod = templates::pod_resource(instance);
    cluster.create_pod(namespace, &pod).await
}

/// Pending → Running: both children are ensured before the phase moves.
pub async fn provision(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    now: Timestamp,
) -> Result<StatusUpdate, Error> {
    ensure_pvc(cluster, instance).await?;
    ensure_pod(cluster, instance).await?;
    Ok(StatusUpdate {
        phase: Some(JobPhase::Running),
        started_at: Some(Time::from(now)),
        pod_name: Some(pod_name_for(instance_name(instance)?)),
        message: Some("Pod created and starting".to_string()),
        ..Default::default()
    })
}

/// The pod vanished mid-run. The artifact volume survived, so a fresh pod
/// gives the job another completion attempt.
pub async fn recreate_pod(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
) -> Result<StatusUpdate, Error> {
    ensure_pod(cluster, instance).await?;
    Ok(StatusUpdate {
        message: Some("Pod recreated".to_string()),
        ..Default::default()
    })
}

pub fn monitor(pod_phase: &str) -> StatusUpdate {
    StatusUpdate {
        message: Some(format!("Pod is {pod_phase}")),
        ..Default::default()
    }
}

/// Running → Succeeded. The pod is reclaimed right away when the pod TTL
/// is zero; a positive TTL retains it for external reaping.
pub async fn succeed(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    now: Timestamp,
) -> Result<StatusUpdate, Error> {
    let namespace = instance_namespace(instance)?;
    let pod_name = pod_name_for(instance_name(instance)?);
    let message = if instance.spec.ttl_seconds_after_finished == 0 {
        cluster.delete_pod(namespace, &pod_name).await?;
        println!("Deleted pod '{}' (TTL=0)", pod_name);
        "Job completed, pod deleted".to_string()
    } else {
        "Job completed successfully".to_string()
    };
    Ok(StatusUpdate {
        phase: Some(JobPhase::Succeeded),
        finished_at: Some(Time::from(now)),
        artifact_path: Some(instance.spec.output.path.clone()),
        message: Some(message),
        ..Default::default()
    })
}

/// Running → Failed. The last lines of output are captured before the pod
/// is deleted; the pod itself is never retained on failure.
pub async fn fail(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    now: Timestamp,
) -> Result<StatusUpdate, Error> {
    let namespace = instance_namespace(instance)?;
    let pod_name = pod_name_for(instance_name(instance)?);
    let message = match cluster
        .pod_logs(namespace, &pod_name, LOG_TAIL_LINES)
        .await?
    {
        Some(logs) if !logs.is_empty() => {
            format!("Job failed. Last logs:\n{}", tail_bytes(&logs, LOG_TAIL_BYTES))
        }
        _ => "Job failed".to_string(),
    };
    cluster.delete_pod(namespace, &pod_name).await?;
    println!("Deleted failed pod '{}'", pod_name);
    Ok(StatusUpdate {
        phase: Some(JobPhase::Failed),
        finished_at: Some(Time::from(now)),
        message: Some(message),
        ..Default::default()
    })
}

/// Deletes the artifact claim once its TTL has run out. Not-found is
/// success, so a re-entered reap never double-deletes.
pub async fn reap_volume(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    reason: String,
) -> Result<StatusUpdate, Error> {
    let namespace = instance_namespace(instance)?;
    let name = pvc_name_for(instance_name(instance)?);
    cluster.delete_pvc(namespace, &name).await?;
    println!("Deleted PVC '{}' • reason: {}", name, reason);
    Ok(StatusUpdate {
        message: Some(reason),
        ..Default::default()
    })
}

/// Permanent validation failure. Only the message is touched, and only
/// when it changed, so a quarantined resource settles instead of patching
/// itself in a loop.
pub fn invalid(instance: &EphemeralAccelerationJob, message: String) -> Option<StatusUpdate> {
    let already_reported = instance
        .status
        .as_ref()
        .and_then(|s| s.message.as_deref())
        .is_some_and(|current| current == message);
    if already_reported {
        return None;
    }
    Some(StatusUpdate {
        message: Some(message),
        ..Default::default()
    })
}

fn tail_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut idx = s.len() - max;
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    &s[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::jobs::testsupport::test_job;
    use std::sync::atomic::Ordering;

    fn now() -> Timestamp {
        Timestamp::from_second(1_700_000_000).unwrap()
    }

    #[tokio::test]
    async fn ensure_is_idempotent_on_a_steady_cluster() {
        let cluster = FakeCluster::default();
        let job = test_job("j1", Some("uid-1"));

        ensure_pvc(&cluster, &job).await.unwrap();
        ensure_pod(&cluster, &job).await.unwrap();
        ensure_pvc(&cluster, &job).await.unwrap();
        ensure_pod(&cluster, &job).await.unwrap();

        assert_eq!(cluster.pvc_creates.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.pod_creates.load(Ordering::SeqCst), 1);
        // Created with owner references in place, so no adoption patch.
        assert_eq!(cluster.owner_patches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ensure_pvc_adopts_an_orphaned_claim() {
        let cluster = FakeCluster::default();
        let job = test_job("j1", Some("uid-1"));

        let mut orphan = templates::pvc_resource(&job);
        orphan.metadata.owner_references = None;
        cluster.create_pvc("default", &orphan).await.unwrap();

        ensure_pvc(&cluster, &job).await.unwrap();
        assert_eq!(cluster.owner_patches.load(Ordering::SeqCst), 1);
        let owners = cluster
            .pvc("default", "artifacts-j1")
            .unwrap()
            .metadata
            .owner_references
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");

        // Populated references are left alone on the next pass.
        ensure_pvc(&cluster, &job).await.unwrap();
        assert_eq!(cluster.owner_patches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provision_creates_both_children_and_moves_to_running() {
        let cluster = FakeCluster::default();
        let job = test_job("j1", Some("uid-1"));

        let update = provision(&cluster, &job, now()).await.unwrap();
        assert_eq!(update.phase, Some(JobPhase::Running));
        assert_eq!(
            update.pod_name.as_deref(),
            Some("ephemeralaccelerationjob-j1")
        );
        assert!(update.started_at.is_some());
        assert!(cluster.pod("default", "ephemeralaccelerationjob-j1").is_some());
        assert!(cluster.pvc("default", "artifacts-j1").is_some());
    }

    #[tokio::test]
    async fn succeed_with_zero_pod_ttl_deletes_the_pod() {
        let cluster = FakeCluster::default();
        let job = test_job("j1", Some("uid-1"));
        provision(&cluster, &job, now()).await.unwrap();

        let update = succeed(&cluster, &job, now()).await.unwrap();
        assert_eq!(update.phase, Some(JobPhase::Succeeded));
        assert!(update.finished_at.is_some());
        assert_eq!(update.artifact_path.as_deref(), Some("/artifacts/output.json"));
        assert!(cluster.pod("default", "ephemeralaccelerationjob-j1").is_none());
        assert_eq!(cluster.pod_deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeed_with_positive_pod_ttl_retains_the_pod() {
        let cluster = FakeCluster::default();
        let mut job = test_job("j1", Some("uid-1"));
        job.spec.ttl_seconds_after_finished = 300;
        provision(&cluster, &job, now()).await.unwrap();

        let update = succeed(&cluster, &job, now()).await.unwrap();
        assert_eq!(update.message.as_deref(), Some("Job completed successfully"));
        assert!(cluster.pod("default", "ephemeralaccelerationjob-j1").is_some());
        assert_eq!(cluster.pod_deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fail_captures_the_log_tail_and_deletes_the_pod() {
        let cluster = FakeCluster::default();
        let job = test_job("j2", Some("uid-2"));
        provision(&cluster, &job, now()).await.unwrap();
        cluster.set_pod_logs(
            "default",
            "ephemeralaccelerationjob-j2",
            "CUDA not available! GPU is required for this job.",
        );

        let update = fail(&cluster, &job, now()).await.unwrap();
        assert_eq!(update.phase, Some(JobPhase::Failed));
        assert!(update.finished_at.is_some());
        assert!(
            update
                .message
                .as_deref()
                .unwrap()
                .ends_with("CUDA not available! GPU is required for this job.")
        );
        assert!(cluster.pod("default", "ephemeralaccelerationjob-j2").is_none());
    }

    #[tokio::test]
    async fn fail_truncates_long_output_to_the_last_bytes() {
        let cluster = FakeCluster::default();
        let job = test_job("j2", Some("uid-2"));
        provision(&cluster, &job, now()).await.unwrap();
        let long = format!("{}TAIL-MARKER", "x".repeat(2_000));
        cluster.set_pod_logs("default", "ephemeralaccelerationjob-j2", &long);

        let update = fail(&cluster, &job, now()).await.unwrap();
        let message = update.message.unwrap();
        assert!(message.ends_with("TAIL-MARKER"));
        assert!(message.len() < 600);
    }

    #[tokio::test]
    async fn reap_volume_deletes_the_claim_once() {
        let cluster = FakeCluster::default();
        let job = test_job("j4", Some("uid-4"));
        provision(&cluster, &job, now()).await.unwrap();

        reap_volume(&cluster, &job, "Artifact PVC deleted (TTL=0)".to_string())
            .await
            .unwrap();
        assert!(cluster.pvc("default", "artifacts-j4").is_none());
        assert_eq!(cluster.pvc_deletes.load(Ordering::SeqCst), 1);

        // A re-entered reap is satisfied by not-found.
        reap_volume(&cluster, &job, "Artifact PVC deleted (TTL=0)".to_string())
            .await
            .unwrap();
        assert_eq!(cluster.pvc_deletes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_reports_once_and_then_settles() {
        let mut job = test_job("j6", Some("uid-6"));
        let first = invalid(&job, "Invalid model: llama".to_string()).unwrap();
        assert_eq!(first.message.as_deref(), Some("Invalid model: llama"));
        assert_eq!(first.phase, None);

        job.status = Some(EphemeralAccelerationJobStatus {
            message: Some("Invalid model: llama".to_string()),
            ..Default::default()
        });
        assert!(invalid(&job, "Invalid model: llama".to_string()).is_none());
    }

    #[test]
    fn update_application_preserves_untouched_fields() {
        let mut status = EphemeralAccelerationJobStatus {
            phase: JobPhase::Running,
            pod_name: Some("ephemeralaccelerationjob-j1".to_string()),
            ..Default::default()
        };
        StatusUpdate {
            message: Some("Pod is Pending".to_string()),
            ..Default::default()
        }
        .apply(&mut status);
        assert_eq!(status.phase, JobPhase::Running);
        assert_eq!(
            status.pod_name.as_deref(),
            Some("ephemeralaccelerationjob-j1")
        );
        assert_eq!(status.message.as_deref(), Some("Pod is Pending"));
    }
}
