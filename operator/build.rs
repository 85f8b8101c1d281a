use gpujob_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/gpu.yourdomain.io_ephemeralaccelerationjobs_crd.yaml",
        serde_yaml::to_string(&EphemeralAccelerationJob::crd()).unwrap(),
    )
    .unwrap();
}
