use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use code_gate_common::frame::CapturedFrame;
use code_gate_common::multipart::MultipartParser;
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::{decode_image, CameraError, FrameSink, FrameSource};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Network camera serving `multipart/x-mixed-replace` JPEG frames over HTTP.
pub struct MjpegSource {
    url: String,
    runtime: Handle,
    sink: Arc<FrameSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MjpegSource {
    /// The reader task is spawned on `runtime` when the source is started.
    pub fn new(url: impl Into<String>, runtime: Handle) -> Self {
        Self {
            url: url.into(),
            runtime,
            sink: Arc::new(FrameSink::new()),
            task: Mutex::new(None),
        }
    }
}

impl FrameSource for MjpegSource {
    fn start(&self) -> Result<(), CameraError> {
        reqwest::Url::parse(&self.url)
            .map_err(|e| CameraError::InvalidUrl(self.url.clone(), e.to_string()))?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }
        let url = self.url.clone();
        let sink = Arc::clone(&self.sink);
        *task = Some(self.runtime.spawn(async move {
            run_mjpeg_source(&url, &sink).await;
        }));
        info!(url = self.url, "MJPEG source started");
        Ok(())
    }

    fn read(&self) -> Option<Arc<CapturedFrame>> {
        self.sink.latest()
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            info!(url = self.url, frames = self.sink.count(), "MJPEG source stopped");
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Consume the MJPEG stream forever, publishing each decoded frame.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_source(stream_url: &str, sink: &FrameSink) {
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, sink).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff.reset();
            }
            Err(e) => {
                error!(error = %e, failures = backoff.failures() + 1, "stream error");
            }
        }
        let delay = backoff.fail();
        debug!(?delay, "waiting before reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn consume_stream(url: &str, sink: &FrameSink) -> Result<(), CameraError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(CameraError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(CameraError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(CameraError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CameraError::HttpStream)?;
        for part in parser.push(&chunk) {
            match decode_image(&part.body) {
                Ok(image) => {
                    let seq = sink.push(image);
                    debug!(seq, bytes = part.body.len(), "frame received");
                }
                Err(e) => {
                    warn!(error = %e, bytes = part.body.len(), "failed to decode frame, skipping");
                }
            }
        }
    }

    Ok(())
}
