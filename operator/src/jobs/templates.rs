//! Pure manifest builders. No cluster calls happen here; the reconciler
//! decides when the rendered objects are applied.

use gpujob_common::annotations;
use gpujob_types::*;
use k8s_openapi::{
    api::core::v1::{
        Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume,
        VolumeMount, VolumeResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::OwnerReference},
};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use std::collections::BTreeMap;

const ARTIFACT_VOLUME: &str = "artifacts";
const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Owner reference back to the job. `controller` is always true; pod
/// teardown blocks job deletion, the claim deliberately does not so users
/// can retain artifacts past the job.
pub fn owner_reference(
    instance: &EphemeralAccelerationJob,
    block_owner_deletion: bool,
) -> Option<OwnerReference> {
    instance.controller_owner_ref(&()).map(|mut reference| {
        reference.block_owner_deletion = Some(block_owner_deletion);
        reference
    })
}

pub fn pod_labels(job_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(JOB_LABEL_KEY.to_string(), job_name.to_string());
    labels
}

pub fn pvc_resource(instance: &EphemeralAccelerationJob) -> PersistentVolumeClaim {
    let name = instance.name_any();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name_for(&name)),
            namespace: instance.namespace(),
            owner_references: owner_reference(instance, false).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(instance.spec.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some({
                    let mut requests = BTreeMap::new();
                    requests.insert(
                        "storage".to_string(),
                        Quantity(instance.spec.pvc_size.clone()),
                    );
                    requests
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_resource(instance: &EphemeralAccelerationJob) -> Pod {
    let name = instance.name_any();
    let spec = &instance.spec;
    let gpu_count = {
        let mut devices = BTreeMap::new();
        devices.insert(
            GPU_RESOURCE.to_string(),
            Quantity(spec.resources.gpu.to_string()),
        );
        devices
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name_for(&name)),
            namespace: instance.namespace(),
            labels: Some(pod_labels(&name)),
            annotations: Some({
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    annotations::CREATED_BY.to_string(),
                    "gpujob-operator".to_string(),
                );
                annotations
            }),
            owner_references: owner_reference(instance, true).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            // A restart would re-run inference with no semantic meaning.
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "inference".to_string(),
                image: Some(spec.image.clone()),
                command: spec.command.clone(),
                args: Some(vec![
                    "--model".to_string(),
                    spec.model.clone(),
                    "--input".to_string(),
                    spec.input.path.clone(),
                    "--output".to_string(),
                    spec.output.path.clone(),
                ]),
                resources: Some(ResourceRequirements {
                    requests: Some(gpu_count.clone()),
                    limits: Some(gpu_count),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: ARTIFACT_VOLUME.to_string(),
                    mount_path: ARTIFACT_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: ARTIFACT_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name_for(&name),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testsupport::test_job;

    #[test]
    fn children_use_derived_names() {
        let job = test_job("j1", Some("uid-1"));
        assert_eq!(
            pod_resource(&job).metadata.name.as_deref(),
            Some("ephemeralaccelerationjob-j1")
        );
        assert_eq!(
            pvc_resource(&job).metadata.name.as_deref(),
            Some("artifacts-j1")
        );
    }

    #[test]
    fn pod_carries_labels_and_single_owner_reference() {
        let job = test_job("j1", Some("uid-1"));
        let pod = pod_resource(&job);
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("gpu-job"));
        assert_eq!(
            labels.get("ephemeralaccelerationjob").map(String::as_str),
            Some("j1")
        );
        let owners = pod.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].kind, "EphemeralAccelerationJob");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn claim_owner_reference_does_not_block_deletion() {
        let job = test_job("j1", Some("uid-1"));
        let owners = pvc_resource(&job).metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[0].block_owner_deletion, Some(false));
    }

    #[test]
    fn claim_owner_reference_omitted_without_uid() {
        let job = test_job("j1", None);
        assert!(pvc_resource(&job).metadata.owner_references.is_none());
    }

    #[test]
    fn container_requests_and_limits_match_declared_gpu_count() {
        let job = test_job("j1", Some("uid-1"));
        let pod = pod_resource(&job);
        let container = &pod.spec.as_ref().unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        let gpu = Quantity("2".to_string());
        assert_eq!(
            resources.requests.as_ref().unwrap().get("nvidia.com/gpu"),
            Some(&gpu)
        );
        assert_eq!(
            resources.limits.as_ref().unwrap().get("nvidia.com/gpu"),
            Some(&gpu)
        );
    }

    #[test]
    fn container_argv_follows_the_image_contract() {
        let job = test_job("j1", Some("uid-1"));
        let pod = pod_resource(&job);
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "--model".to_string(),
                "resnet50".to_string(),
                "--input".to_string(),
                "/artifacts/input.jpg".to_string(),
                "--output".to_string(),
                "/artifacts/output.json".to_string(),
            ]
        );
        assert!(container.command.is_none());
    }

    #[test]
    fn pod_never_restarts_and_mounts_the_artifact_claim() {
        let job = test_job("j1", Some("uid-1"));
        let pod = pod_resource(&job);
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let mount = &spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/artifacts");
        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "artifacts-j1"
        );
    }

    #[test]
    fn claim_uses_declared_class_and_size() {
        let mut job = test_job("j1", Some("uid-1"));
        job.spec.storage_class = "longhorn".to_string();
        job.spec.pvc_size = "10Gi".to_string();
        let pvc = pvc_resource(&job);
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("longhorn"));
        assert_eq!(spec.access_modes.as_ref().unwrap(), &vec!["ReadWriteOnce"]);
        assert_eq!(
            spec.resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("storage"),
            Some(&Quantity("10Gi".to_string()))
        );
    }
}
