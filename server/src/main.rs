mod pipeline;
mod routes;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use code_gate_camera::{CameraError, FrameSource, MjpegSource, StillSource};
use code_gate_common::config::{CameraConfig, Config};
use code_gate_common::slot::LatestSlot;
use code_gate_vision::{spawn_alert_worker, Annotator, QrDetector};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, PipelineError, PipelineSettings};
use crate::routes::AppState;

fn build_source(config: &CameraConfig) -> Result<Arc<dyn FrameSource>, CameraError> {
    match config.source.as_str() {
        "v4l" => v4l_source(config),
        "mjpeg" => Ok(Arc::new(MjpegSource::new(
            config.url.clone(),
            tokio::runtime::Handle::current(),
        ))),
        "file" => Ok(Arc::new(StillSource::from_path(&config.path))),
        other => Err(CameraError::Unavailable(other.to_string())),
    }
}

#[cfg(feature = "v4l")]
fn v4l_source(config: &CameraConfig) -> Result<Arc<dyn FrameSource>, CameraError> {
    Ok(Arc::new(code_gate_camera::V4lSource::new(
        config.device,
        config.width,
        config.height,
    )))
}

#[cfg(not(feature = "v4l"))]
fn v4l_source(_config: &CameraConfig) -> Result<Arc<dyn FrameSource>, CameraError> {
    Err(CameraError::Unavailable("v4l".into()))
}

#[tokio::main]
async fn main() {
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Without an argument a missing config.toml just means defaults.
    let config = if explicit_path.is_none() && !config_path.exists() {
        Config::default()
    } else {
        match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config from {}: {e}", config_path.display());
                std::process::exit(1);
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = config.camera.source,
        port = config.server.port,
        "starting code-gate"
    );

    let camera = match build_source(&config.camera) {
        Ok(camera) => camera,
        Err(e) => {
            error!(
                source = config.camera.source,
                error = %e,
                "unusable camera source, expected 'v4l', 'mjpeg' or 'file'"
            );
            std::process::exit(1);
        }
    };
    if let Err(e) = camera.start() {
        error!(source = camera.name(), error = %e, "failed to start camera");
        std::process::exit(1);
    }

    let annotator = Annotator::load(&config.annotation);
    // Detached: the worker exits once the pipeline drops its sender.
    let (alerts, _alert_worker) = spawn_alert_worker(&config.alert);
    let frames = Arc::new(LatestSlot::new());
    let running = Arc::new(AtomicBool::new(true));

    let pipeline = Pipeline::new(
        Arc::clone(&camera),
        Box::new(QrDetector::new()),
        annotator,
        alerts,
        Arc::clone(&frames),
        PipelineSettings::from(&config.pipeline),
    );
    let (done_tx, done_rx) = oneshot::channel::<Result<(), PipelineError>>();
    let processing = {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("gate-processing".into())
            .spawn(move || {
                let _ = done_tx.send(pipeline.run(&running));
            })
    };
    let processing = match processing {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start processing thread");
            camera.stop();
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        frames,
        jpeg_quality: config.pipeline.jpeg_quality,
        idle_sleep: PipelineSettings::from(&config.pipeline).idle_sleep,
        running: Arc::clone(&running),
    });
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {addr}: {e}");
            running.store(false, Ordering::SeqCst);
            let _ = processing.join();
            camera.stop();
            std::process::exit(1);
        }
    };
    info!(addr, "code-gate server listening");

    let failed = Arc::new(AtomicBool::new(false));
    let shutdown = {
        let failed = Arc::clone(&failed);
        let running = Arc::clone(&running);
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                result = done_rx => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "processing loop stopped");
                            failed.store(true, Ordering::SeqCst);
                        }
                        Err(_) => {
                            error!("processing thread exited unexpectedly");
                            failed.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }
            // Ends the processing loop and every open stream.
            running.store(false, Ordering::SeqCst);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "server error");
    }

    running.store(false, Ordering::SeqCst);
    if processing.join().is_err() {
        warn!("processing thread panicked");
    }
    camera.stop();
    info!("code-gate stopped");

    if failed.load(Ordering::SeqCst) {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_source_is_available_in_every_build() {
        let config = CameraConfig::default();
        let source = build_source(&config).unwrap();
        assert_eq!(source.name(), "mjpeg");
    }

    #[tokio::test]
    async fn unknown_source_is_unavailable() {
        let config = CameraConfig {
            source: "carrier-pigeon".into(),
            ..CameraConfig::default()
        };
        assert!(matches!(
            build_source(&config),
            Err(CameraError::Unavailable(name)) if name == "carrier-pigeon"
        ));
    }

    #[cfg(not(feature = "v4l"))]
    #[tokio::test]
    async fn v4l_needs_its_feature() {
        let config = CameraConfig {
            source: "v4l".into(),
            ..CameraConfig::default()
        };
        assert!(matches!(build_source(&config), Err(CameraError::Unavailable(_))));
    }
}
