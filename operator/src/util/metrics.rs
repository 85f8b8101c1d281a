use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;

lazy_static! {
    /// All controller collectors register here; the scrape endpoint gathers
    /// from this registry only.
    pub(crate) static ref REGISTRY: Registry = Registry::new();
}

/// Per-controller instrumentation. The read phase is the observation pass
/// (`determine_action`), the write phase is the action execution plus the
/// status patch.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_reconcile_total"),
                "Total number of reconcile invocations",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = IntCounterVec::new(
            Opts::new(
                format!("{controller}_action_total"),
                "Reconcile actions by kind",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_read_phase_seconds"),
                "Duration of the observation pass",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("{controller}_write_phase_seconds"),
                "Duration of the action execution and status patch",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        REGISTRY
            .register(Box::new(reconcile_counter.clone()))
            .unwrap();
        REGISTRY.register(Box::new(action_counter.clone())).unwrap();
        REGISTRY.register(Box::new(read_histogram.clone())).unwrap();
        REGISTRY
            .register(Box::new(write_histogram.clone()))
            .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

/// Serves `/metrics`, `/healthz` and `/readyz` until the process receives a
/// shutdown signal.
pub async fn run_metrics_server(port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("🛑 Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let shutdown = gpujob_common::shutdown::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!("{}", "🛑 Metrics server stopped".red());
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("metrics server accept failed: {e}");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(handle))
                        .await
                    {
                        eprintln!("metrics connection error: {e}");
                    }
                });
            }
        }
    }
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buf = Vec::new();
            let families = REGISTRY.gather();
            if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
                eprintln!("failed to encode metrics: {e}");
            }
            Response::builder()
                .header(hyper::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
                .body(Full::new(Bytes::from(buf)))
                .unwrap()
        }
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}
