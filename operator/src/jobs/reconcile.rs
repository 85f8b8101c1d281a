use futures::stream::StreamExt;
use gpujob_types::*;
use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, Pod},
    jiff::Timestamp,
};
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{actions, validate};
use crate::cluster::{ClusterAccess, KubeCluster, observe_pod};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
    patch::patch_status,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `EphemeralAccelerationJob` controller.
///
/// The `kube_runtime::Controller` is both the event dispatcher and the
/// timer driver: watch events on the job resource and on its owned
/// children invoke `reconcile` immediately, and every completed
/// reconciliation requeues after `PROBE_INTERVAL` so terminal jobs keep
/// getting ticks for the volume TTL. Reconciliations of the same resource
/// are serialized by the runtime; we additionally gate the whole
/// controller behind a lease so only one replica reconciles.
pub async fn run(client: Client, namespace: &str) -> Result<(), Error> {
    println!(
        "{}",
        "⚙️ Starting EphemeralAccelerationJob controller...".green()
    );

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("gpujob-operator-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "gpujob-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        gpujob_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    gpujob_common::signal_ready();

    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = namespace.to_string();
                let jobs_api: Api<EphemeralAccelerationJob> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!(
                        "{}",
                        "🚀 EphemeralAccelerationJob controller started.".green()
                    );
                    Controller::new(jobs_api, Default::default())
                        .owns(
                            Api::<Pod>::namespaced(
                                client_for_controller.clone(),
                                &controller_namespace,
                            ),
                            Default::default(),
                        )
                        .owns(
                            Api::<PersistentVolumeClaim>::namespaced(
                                client_for_controller,
                                &controller_namespace,
                            ),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    client: Client,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (JobAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                metrics: ControllerMetrics::new("gpujob"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// Action to be taken upon an `EphemeralAccelerationJob` resource during
/// reconciliation. This is the read phase's verdict; the write phase only
/// executes it.
#[derive(Debug, PartialEq, Clone)]
pub(crate) enum JobAction {
    /// Ensure the artifact claim and the compute pod, then move to Running.
    Provision,

    /// The pod vanished while the job was Running; put it back.
    RecreatePod,

    /// The pod is alive but not finished; reflect its phase in the status.
    Monitor { pod_phase: String },

    /// The pod reached `Succeeded`.
    Succeed,

    /// The pod reached `Failed`.
    Fail,

    /// The artifact volume TTL has run out.
    ReapVolume { reason: String },

    /// The spec failed validation; reconciliation halts until a spec edit.
    Invalid(String),

    /// The job is in desired state and requires no writes.
    NoOp,

    Requeue(Duration),
}

impl JobAction {
    fn to_str(&self) -> &str {
        match self {
            JobAction::Provision => "Provision",
            JobAction::RecreatePod => "RecreatePod",
            JobAction::Monitor { .. } => "Monitor",
            JobAction::Succeed => "Succeed",
            JobAction::Fail => "Fail",
            JobAction::ReapVolume { .. } => "ReapVolume",
            JobAction::Invalid(_) => "Invalid",
            JobAction::NoOp => "NoOp",
            JobAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `EphemeralAccelerationJob` resource.
async fn reconcile(
    instance: Arc<EphemeralAccelerationJob>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            // If there is no namespace the resource is malformed; reconciliation ends with an error immediately.
            return Err(Error::UserInput(
                "Expected EphemeralAccelerationJob resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };

    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let cluster = KubeCluster::new(client.clone());

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(&cluster, &instance, Timestamp::now()).await?;

    if action != JobAction::NoOp {
        let previous = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        let newsworthy = previous.as_ref().is_none_or(|(last_action, last_instant)| {
            last_action != &action || last_instant.elapsed() > Duration::from_secs(300)
        });
        if newsworthy {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{:?}", action).color(FG2),
            );
        }
    }

    // Report the read phase performance.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        // Don't measure performance for NoOp actions.
        JobAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    // Write phase: perform the child writes and compute the status patch.
    // The patch is applied to the version of the resource we observed; on
    // conflict the runtime retries with fresh observation.
    let update = match &action {
        JobAction::NoOp | JobAction::Requeue(_) => None,
        JobAction::Provision => Some(actions::provision(&cluster, &instance, Timestamp::now()).await?),
        JobAction::RecreatePod => Some(actions::recreate_pod(&cluster, &instance).await?),
        JobAction::Monitor { pod_phase } => Some(actions::monitor(pod_phase)),
        JobAction::Succeed => Some(actions::succeed(&cluster, &instance, Timestamp::now()).await?),
        JobAction::Fail => Some(actions::fail(&cluster, &instance, Timestamp::now()).await?),
        JobAction::ReapVolume { reason } => {
            Some(actions::reap_volume(&cluster, &instance, reason.clone()).await?)
        }
        JobAction::Invalid(message) => actions::invalid(&instance, message.clone()),
    };
    if let Some(update) = update {
        patch_status(client, &*instance, move |status| update.apply(status)).await?;
    }

    let result = match action {
        // Permanent until the user edits the spec; the update event
        // re-enters reconciliation.
        JobAction::Invalid(_) => Action::await_change(),
        JobAction::Requeue(duration) => Action::requeue(duration),
        // Everything else stays on the timer floor, terminal phases
        // included (volume TTL).
        _ => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Returns the phase of the job, Pending when status is absent.
pub fn get_phase(instance: &EphemeralAccelerationJob) -> JobPhase {
    instance
        .status
        .as_ref()
        .map(|status| status.phase)
        .unwrap_or_default()
}

/// Read phase. Looks at the observed `(spec, status, cluster)` and decides
/// the next action; all branching happens on observation, never on state
/// carried between invocations.
async fn determine_action(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    now: Timestamp,
) -> Result<JobAction, Error> {
    // Don't do anything while being deleted; owner references cascade to
    // the pod, and the claim deliberately does not block.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(JobAction::Requeue(Duration::from_secs(2)));
    }

    if let Err(message) = validate::validate(&instance.spec) {
        return Ok(JobAction::Invalid(message));
    }

    let namespace = instance.namespace().ok_or_else(|| {
        Error::UserInput("Expected EphemeralAccelerationJob resource to be namespaced.".to_owned())
    })?;
    let name = instance.name_any();

    match get_phase(instance) {
        JobPhase::Pending => Ok(JobAction::Provision),
        JobPhase::Running => {
            let pod = cluster.get_pod(&namespace, &pod_name_for(&name)).await?;
            let Some(pod) = pod else {
                return Ok(JobAction::RecreatePod);
            };
            let observed = observe_pod(&pod);
            match observed.phase.as_str() {
                "Succeeded" => Ok(JobAction::Succeed),
                "Failed" => Ok(JobAction::Fail),
                other => {
                    // Settle once the message reflects the pod phase.
                    let message = format!("Pod is {other}");
                    let current = instance.status.as_ref().and_then(|s| s.message.as_deref());
                    if current == Some(message.as_str()) {
                        Ok(JobAction::NoOp)
                    } else {
                        Ok(JobAction::Monitor {
                            pod_phase: other.to_string(),
                        })
                    }
                }
            }
        }
        JobPhase::Succeeded | JobPhase::Failed => {
            evaluate_volume_ttl(cluster, instance, &namespace, &name, now).await
        }
    }
}

/// The volume TTL is evaluated on every tick in a terminal phase. The
/// delete happens at most once: a reclaimed or terminating claim reads as
/// nothing to do.
async fn evaluate_volume_ttl(
    cluster: &dyn ClusterAccess,
    instance: &EphemeralAccelerationJob,
    namespace: &str,
    name: &str,
    now: Timestamp,
) -> Result<JobAction, Error> {
    let claim = match cluster.get_pvc(namespace, &pvc_name_for(name)).await? {
        None => return Ok(JobAction::NoOp),
        Some(claim) => claim,
    };
    if claim.metadata.deletion_timestamp.is_some() {
        return Ok(JobAction::NoOp);
    }

    let ttl = instance.spec.pvc_ttl_seconds_after_finished;
    if ttl == 0 {
        return Ok(JobAction::ReapVolume {
            reason: "Artifact PVC deleted (TTL=0)".to_string(),
        });
    }

    let finished_at = instance
        .status
        .as_ref()
        .and_then(|status| status.finished_at.as_ref());
    let Some(finished_at) = finished_at else {
        eprintln!(
            "{}",
            format!("Job '{name}' is terminal without finishedAt; skipping volume TTL check")
                .yellow()
        );
        return Ok(JobAction::NoOp);
    };
    let elapsed = now.duration_since(finished_at.0);
    let Ok(elapsed) = std::time::Duration::try_from(elapsed) else {
        eprintln!(
            "{}",
            format!("Job '{name}' finishedAt is in the future; skipping volume TTL check").yellow()
        );
        return Ok(JobAction::NoOp);
    };
    if elapsed.as_secs() >= ttl as u64 {
        Ok(JobAction::ReapVolume {
            reason: format!(
                "Artifact PVC deleted (TTL expired: {}s >= {}s)",
                elapsed.as_secs(),
                ttl
            ),
        })
    } else {
        Ok(JobAction::NoOp)
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Transient cluster errors land here; nothing was patched, and the requeue
/// retries with fresh observation.
fn on_error(
    instance: Arc<EphemeralAccelerationJob>,
    error: &Error,
    _context: Arc<ContextData>,
) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error: {:?} ({}/{})",
            error,
            instance.namespace().unwrap_or_default(),
            instance.name_any()
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
