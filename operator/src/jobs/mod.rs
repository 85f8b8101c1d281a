pub mod actions;
pub mod reconcile;
pub mod templates;
pub mod validate;

#[cfg(test)]
pub(crate) mod testsupport {
    use gpujob_types::EphemeralAccelerationJob;

    /// A minimal valid job resource; tests tweak the spec in place.
    pub(crate) fn test_job(name: &str, uid: Option<&str>) -> EphemeralAccelerationJob {
        let mut job = EphemeralAccelerationJob::new(
            name,
            serde_json::from_value(serde_json::json!({
                "model": "resnet50",
                "input": { "path": "/artifacts/input.jpg" },
                "output": { "path": "/artifacts/output.json" },
                "resources": { "gpu": 2 },
            }))
            .unwrap(),
        );
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = uid.map(|u| u.to_string());
        job
    }
}
