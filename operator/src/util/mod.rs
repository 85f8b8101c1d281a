use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource. This is the timer
/// floor for every live job, terminal phases included (the volume TTL is
/// evaluated on it).
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "gpujob-operator";
