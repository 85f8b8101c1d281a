use gpujob_types::{ALLOWED_MODELS, EphemeralAccelerationJobSpec};

/// Structural checks on the declared spec. A failure here is permanent for
/// this generation of the spec: the reconciler reports it and halts instead
/// of retrying, until the user edits the resource.
pub fn validate(spec: &EphemeralAccelerationJobSpec) -> Result<(), String> {
    if !ALLOWED_MODELS.contains(&spec.model.as_str()) {
        return Err(format!(
            "Invalid model: {}. Allowed: {}",
            spec.model,
            ALLOWED_MODELS.join(", ")
        ));
    }
    if spec.resources.gpu < 1 {
        return Err(format!(
            "resources.gpu must be a positive integer, got {}",
            spec.resources.gpu
        ));
    }
    if spec.ttl_seconds_after_finished < 0 {
        return Err(format!(
            "ttlSecondsAfterFinished must not be negative, got {}",
            spec.ttl_seconds_after_finished
        ));
    }
    if spec.pvc_ttl_seconds_after_finished < 0 {
        return Err(format!(
            "pvcTTLSecondsAfterFinished must not be negative, got {}",
            spec.pvc_ttl_seconds_after_finished
        ));
    }
    Ok(())
}
