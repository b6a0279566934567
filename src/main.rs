use anyhow::Result;
use axum::{routing::get, Router};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use superres_node::{metrics, Config, JobError, JobStatus, UpscaleService};
use tower_http::trace::TraceLayer;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Serve `/health` and `/metrics` until the process exits
async fn start_metrics_server(bind_addr: String) -> Result<()> {
    let addr: std::net::SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid METRICS_BIND address: {}", e))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("📊 Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

fn job_id_for(path: &std::path::Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let short = uuid::Uuid::new_v4().simple().to_string();
    let clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}-{}", clean, &short[..8])
}

/// Log progress changes until every job is terminal or gone
async fn watch(service: &UpscaleService, jobs: &[String]) -> usize {
    let mut last: Vec<Option<(u8, JobStatus)>> = vec![None; jobs.len()];
    let mut finished = HashSet::new();
    let mut failures = 0;

    while finished.len() < jobs.len() {
        for (i, id) in jobs.iter().enumerate() {
            if finished.contains(id) {
                continue;
            }
            match service.progress(id) {
                Ok(view) => {
                    if last[i] != Some((view.progress, view.status)) {
                        tracing::info!(job_id = %id, progress = view.progress, status = %view.status, "Progress");
                        last[i] = Some((view.progress, view.status));
                    }
                    match view.status {
                        JobStatus::Done => {
                            if let Ok(reference) = service.download(id) {
                                tracing::info!(job_id = %id, output = %reference, "✅ Output ready");
                                // machine-readable result on stdout, logs go to stderr
                                println!(
                                    "{}",
                                    serde_json::json!({
                                        "job_id": id,
                                        "output_reference": reference,
                                        "completed_time": view.completed_time,
                                    })
                                );
                            }
                            finished.insert(id.clone());
                        }
                        JobStatus::Error => {
                            tracing::error!(job_id = %id, error = ?view.error, "❌ Job failed");
                            failures += 1;
                            finished.insert(id.clone());
                        }
                        _ => {}
                    }
                }
                Err(JobError::JobNotFound(_)) => {
                    tracing::warn!(job_id = %id, "Job record gone");
                    failures += 1;
                    finished.insert(id.clone());
                }
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Progress read failed"),
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    failures
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    // ONNX Runtime logs every graph optimization at info
                    .add_directive("ort=warn".parse().expect("static directive"))
            }),
        )
        .init();

    tracing::info!("Starting super-resolution node...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let config = Config::load()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        output_dir = %config.output_dir.display(),
        scale = config.tiling.scale,
        tile_size = config.tiling.tile_size,
        tile_pad = config.tiling.tile_pad,
        buffer_mode = config.buffer_mode.as_str(),
        "Configuration loaded"
    );

    if let Some(bind) = config.metrics_bind.clone() {
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(bind).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    let inputs: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    let service = UpscaleService::from_config(config)?;

    let mut jobs = Vec::new();
    for input in &inputs {
        let id = job_id_for(input);
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", input.display(), e))?;
        service.stage_upload(&id, &file_name, &bytes).await?;
        service.start(&id).await?;
        tracing::info!(job_id = %id, input = %input.display(), "🚀 Job submitted");
        jobs.push(id);
    }

    let failures = if jobs.is_empty() {
        tracing::info!("No inputs given, serving until Ctrl-C");
        let _ = tokio::signal::ctrl_c().await;
        0
    } else {
        tokio::select! {
            failures = watch(&service, &jobs) => failures,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling outstanding jobs");
                jobs.len()
            }
        }
    };

    service.shutdown().await;

    if failures > 0 {
        anyhow::bail!("{} of {} jobs did not complete", failures, jobs.len());
    }
    Ok(())
}
