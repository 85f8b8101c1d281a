use anyhow::Result;
use clap::Parser;
use kube::Client;

mod cluster;
mod jobs;
mod util;

#[derive(Parser, Debug)]
#[command(author, version, about = "Controller for ephemeral GPU inference jobs")]
struct Args {
    /// Namespace to run leader election and the controller in
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Serve /metrics and /healthz on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    gpujob_common::init();

    let args = Args::parse();

    // In-cluster service account first; falls back to the local kubeconfig
    // for out-of-cluster operation.
    let client = Client::try_default().await?;

    #[cfg(feature = "metrics")]
    if let Some(port) = args.metrics_port {
        tokio::spawn(util::metrics::run_metrics_server(port));
    }
    #[cfg(not(feature = "metrics"))]
    if args.metrics_port.is_some() {
        eprintln!("built without the metrics feature; ignoring --metrics-port");
    }

    jobs::reconcile::run(client, &args.namespace).await?;
    Ok(())
}
