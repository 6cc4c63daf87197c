//! Local webcam capture through V4L2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use code_gate_common::frame::CapturedFrame;
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use crate::backoff::Backoff;
use crate::convert::yuyv_to_rgb;
use crate::{decode_image, CameraError, FrameSink, FrameSource};

const BUFFER_COUNT: u32 = 4;
const DEQUEUE_RETRY: Duration = Duration::from_millis(10);
const DEQUEUE_RETRY_MAX: Duration = Duration::from_secs(1);
/// Dequeue failures in a row after which the device is considered gone.
const MAX_DEQUEUE_FAILURES: u32 = 50;

pub struct V4lSource {
    device: usize,
    width: u32,
    height: u32,
    sink: Arc<FrameSink>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl V4lSource {
    pub fn new(device: usize, width: u32, height: u32) -> Self {
        Self {
            device,
            width,
            height,
            sink: Arc::new(FrameSink::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    fn path(&self) -> String {
        format!("/dev/video{}", self.device)
    }
}

impl FrameSource for V4lSource {
    /// Opens the device on the capture thread and waits until the stream is
    /// running, so open and format errors surface here.
    fn start(&self) -> Result<(), CameraError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded(1);
        let device = self.device;
        let size = (self.width, self.height);
        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("v4l-capture".into())
            .spawn(move || capture_loop(device, size, &sink, &running, ready_tx))
            .map_err(|e| CameraError::Open(self.path(), e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(format)) => {
                info!(
                    device = self.path(),
                    width = format.width,
                    height = format.height,
                    fourcc = %format.fourcc,
                    "webcam capture started"
                );
                *worker = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(CameraError::Open(
                    self.path(),
                    "capture thread exited before the stream started".into(),
                ))
            }
        }
    }

    fn read(&self) -> Option<Arc<CapturedFrame>> {
        self.sink.latest()
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(device = self.path(), "capture thread panicked");
            }
            info!(device = self.path(), frames = self.sink.count(), "webcam released");
        }
    }

    fn name(&self) -> &str {
        "v4l"
    }
}

/// Negotiate MJPG, falling back to YUYV.
fn negotiate_format(dev: &Device, width: u32, height: u32) -> Result<Format, CameraError> {
    let path = "v4l device".to_string();
    for fourcc in [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")] {
        let wanted = Format::new(width, height, fourcc);
        let actual = dev
            .set_format(&wanted)
            .map_err(|e| CameraError::Open(path.clone(), e.to_string()))?;
        if actual.fourcc == fourcc {
            return Ok(actual);
        }
        debug!(wanted = %fourcc, got = %actual.fourcc, "format not accepted");
    }
    let current = dev
        .format()
        .map_err(|e| CameraError::Open(path, e.to_string()))?;
    Err(CameraError::Format(current.fourcc.to_string()))
}

fn capture_loop(
    device: usize,
    (width, height): (u32, u32),
    sink: &FrameSink,
    running: &AtomicBool,
    ready: Sender<Result<Format, CameraError>>,
) {
    let path = format!("/dev/video{device}");
    let opened = Device::new(device)
        .map_err(|e| CameraError::Open(path.clone(), e.to_string()))
        .and_then(|dev| {
            let format = negotiate_format(&dev, width, height)?;
            Ok((dev, format))
        });
    let (dev, format) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(CameraError::Open(path, e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(format.clone()));

    let is_mjpeg = format.fourcc == FourCC::new(b"MJPG");
    let mut retry = Backoff::new(DEQUEUE_RETRY, DEQUEUE_RETRY_MAX);
    while running.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(frame) => {
                retry.reset();
                frame
            }
            Err(e) => {
                let delay = retry.fail();
                if retry.failures() >= MAX_DEQUEUE_FAILURES {
                    error!(
                        device = path,
                        error = %e,
                        failures = retry.failures(),
                        "device keeps failing, capture stopped"
                    );
                    break;
                }
                warn!(device = path, error = %e, ?delay, "failed to dequeue buffer");
                thread::sleep(delay);
                continue;
            }
        };
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let data = &buf[..used];

        let image = if is_mjpeg {
            match decode_image(data) {
                Ok(image) => image,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable MJPG buffer");
                    continue;
                }
            }
        } else {
            match yuyv_to_rgb(data, format.width, format.height) {
                Some(image) => image,
                None => {
                    debug!(bytes = data.len(), "dropping short YUYV buffer");
                    continue;
                }
            }
        };
        sink.push(image);
    }
    // `stream` and `dev` drop here, releasing the device.
}
