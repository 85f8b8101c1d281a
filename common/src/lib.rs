pub mod shutdown;

/// Marks the container ready for the kubelet's exec readiness probe.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATED_BY: &str = "gpu.yourdomain.io/created-by";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
