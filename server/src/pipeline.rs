//! The processing loop: read, detect, rectify, classify, annotate, publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use code_gate_camera::FrameSource;
use code_gate_common::config::PipelineConfig;
use code_gate_common::frame::{AnnotatedFrame, CapturedFrame};
use code_gate_common::slot::LatestSlot;
use code_gate_common::verdict::Verdict;
use code_gate_vision::{
    classify, four_point_transform, to_hsv, AlertSender, Annotator, MarkerDetector, Tone,
};
use tracing::{debug, info, trace, warn};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PipelineError {
    #[error("detector failed {consecutive} times in a row")]
    DetectorFailing { consecutive: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub idle_sleep: Duration,
    /// 0 disables the limit.
    pub max_consecutive_failures: u32,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            idle_sleep: Duration::from_millis(config.idle_sleep_ms),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Classified(Verdict),
    /// No usable marker; the raw frame was published.
    Unmarked,
    /// The detector errored; the raw frame was published.
    DetectFailed,
}

pub struct Pipeline {
    source: Arc<dyn FrameSource>,
    detector: Box<dyn MarkerDetector>,
    annotator: Annotator,
    alerts: AlertSender,
    output: Arc<LatestSlot<AnnotatedFrame>>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn FrameSource>,
        detector: Box<dyn MarkerDetector>,
        annotator: Annotator,
        alerts: AlertSender,
        output: Arc<LatestSlot<AnnotatedFrame>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            detector,
            annotator,
            alerts,
            output,
            settings,
        }
    }

    /// Run one frame through the stages and publish the result.
    pub fn process(&self, frame: &CapturedFrame) -> FrameOutcome {
        let marker = match self.detector.detect(&frame.image) {
            Ok(Some(marker)) if !marker.payload.is_empty() => marker,
            Ok(_) => {
                self.output.publish(AnnotatedFrame::raw(frame));
                return FrameOutcome::Unmarked;
            }
            Err(e) => {
                warn!(
                    seq = frame.seq,
                    detector = self.detector.name(),
                    error = %e,
                    "detection failed"
                );
                self.output.publish(AnnotatedFrame::raw(frame));
                return FrameOutcome::DetectFailed;
            }
        };

        let region = match four_point_transform(&frame.image, &marker.corners) {
            Ok(region) => region,
            Err(e) => {
                debug!(seq = frame.seq, error = %e, "marker region not usable");
                self.output.publish(AnnotatedFrame::raw(frame));
                return FrameOutcome::Unmarked;
            }
        };

        let verdict = classify(&to_hsv(&region));
        trace!(seq = frame.seq, payload = %marker.payload, %verdict, "frame classified");

        let annotated = self.annotator.annotate(&frame.image, verdict);
        self.alerts.notify(Tone::for_verdict(verdict));
        self.output.publish(AnnotatedFrame::classified(
            frame,
            annotated,
            verdict,
            marker.payload,
        ));
        FrameOutcome::Classified(verdict)
    }

    /// Loop until `running` is cleared, or until the detector has failed
    /// `max_consecutive_failures` times in a row.
    pub fn run(&self, running: &AtomicBool) -> Result<(), PipelineError> {
        info!(
            source = self.source.name(),
            detector = self.detector.name(),
            "processing loop started"
        );
        let mut last_seq: Option<u64> = None;
        let mut failures: u32 = 0;
        let mut processed: u64 = 0;

        while running.load(Ordering::Relaxed) {
            let frame = match self.source.read() {
                Some(frame) if last_seq != Some(frame.seq) => frame,
                _ => {
                    thread::sleep(self.settings.idle_sleep);
                    continue;
                }
            };
            last_seq = Some(frame.seq);

            match self.process(&frame) {
                FrameOutcome::DetectFailed => {
                    failures += 1;
                    let limit = self.settings.max_consecutive_failures;
                    if limit > 0 && failures >= limit {
                        return Err(PipelineError::DetectorFailing {
                            consecutive: failures,
                        });
                    }
                }
                _ => failures = 0,
            }
            processed += 1;
        }

        info!(processed, "processing loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::sync::Mutex;

    use code_gate_camera::{CameraError, StillSource};
    use code_gate_common::config::AnnotationConfig;
    use code_gate_vision::{spawn_alert_worker_with, DetectError, Marker, TonePlayer};
    use image::{Rgb, RgbImage};
    use nalgebra::Point2;

    fn square(payload: &str, x0: f32, y0: f32, x1: f32, y1: f32) -> Marker {
        Marker {
            payload: payload.to_string(),
            corners: [
                Point2::new(x0, y0),
                Point2::new(x1, y0),
                Point2::new(x1, y1),
                Point2::new(x0, y1),
            ],
        }
    }

    struct Fixed(Option<Marker>);

    impl MarkerDetector for Fixed {
        fn detect(&self, _frame: &RgbImage) -> Result<Option<Marker>, DetectError> {
            Ok(self.0.clone())
        }
    }

    /// Fails on every call whose index is in the pattern's `true` slots,
    /// cycling, and clears `running` after `stop_after` calls.
    struct Scripted {
        pattern: Vec<bool>,
        calls: Arc<AtomicUsize>,
        stop_after: usize,
        running: Arc<AtomicBool>,
    }

    impl MarkerDetector for Scripted {
        fn detect(&self, _frame: &RgbImage) -> Result<Option<Marker>, DetectError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.stop_after {
                self.running.store(false, Ordering::SeqCst);
            }
            if self.pattern[n % self.pattern.len()] {
                Err(DetectError::Panicked("scripted".into()))
            } else {
                Ok(None)
            }
        }
    }

    /// Produces a fresh frame on every read.
    struct Endless(AtomicU64);

    impl FrameSource for Endless {
        fn start(&self) -> Result<(), CameraError> {
            Ok(())
        }

        fn read(&self) -> Option<Arc<CapturedFrame>> {
            let seq = self.0.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(CapturedFrame::new(RgbImage::new(8, 8), seq)))
        }

        fn stop(&self) {}
    }

    struct Recorder(Arc<Mutex<Vec<Tone>>>);

    impl TonePlayer for Recorder {
        fn play(&mut self, tone: Tone) -> Result<(), code_gate_vision::alert::AlertError> {
            self.0.lock().unwrap().push(tone);
            Ok(())
        }
    }

    fn settings(max_consecutive_failures: u32) -> PipelineSettings {
        PipelineSettings {
            idle_sleep: Duration::from_millis(1),
            max_consecutive_failures,
        }
    }

    fn pipeline(
        source: Arc<dyn FrameSource>,
        detector: Box<dyn MarkerDetector>,
        alerts: AlertSender,
        max_failures: u32,
    ) -> (Pipeline, Arc<LatestSlot<AnnotatedFrame>>) {
        let output = Arc::new(LatestSlot::new());
        let annotator = Annotator::builtin(&AnnotationConfig::default());
        let p = Pipeline::new(
            source,
            detector,
            annotator,
            alerts,
            Arc::clone(&output),
            settings(max_failures),
        );
        (p, output)
    }

    fn teal_frame() -> CapturedFrame {
        CapturedFrame::new(RgbImage::from_pixel(200, 160, Rgb([0, 180, 200])), 7)
    }

    #[test]
    fn green_marker_region_is_go() {
        let played = Arc::new(Mutex::new(Vec::new()));
        let (alerts, worker) = spawn_alert_worker_with(Recorder(played.clone()), 4);
        let detector = Fixed(Some(square("gate-1", 50.0, 40.0, 150.0, 120.0)));
        let source = Arc::new(StillSource::from_image(RgbImage::new(1, 1)));
        let (p, output) = pipeline(source, Box::new(detector), alerts, 0);

        let frame = teal_frame();
        assert_eq!(p.process(&frame), FrameOutcome::Classified(Verdict::Go));

        let published = output.snapshot().unwrap();
        assert_eq!(published.verdict, Some(Verdict::Go));
        assert_eq!(published.payload.as_deref(), Some("gate-1"));
        assert_eq!(published.seq, 7);
        assert_eq!(published.image.dimensions(), frame.image.dimensions());
        assert_ne!(published.image, frame.image);

        drop(p);
        worker.unwrap().join().unwrap();
        assert_eq!(*played.lock().unwrap(), vec![Tone::for_verdict(Verdict::Go)]);
    }

    #[test]
    fn red_marker_region_is_stop() {
        let detector = Fixed(Some(square("gate-1", 10.0, 10.0, 90.0, 90.0)));
        let source = Arc::new(StillSource::from_image(RgbImage::new(1, 1)));
        let (p, output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 0);

        let frame = CapturedFrame::new(RgbImage::from_pixel(100, 100, Rgb([200, 20, 0])), 1);
        assert_eq!(p.process(&frame), FrameOutcome::Classified(Verdict::Stop));
        assert_eq!(output.snapshot().unwrap().verdict, Some(Verdict::Stop));
    }

    #[test]
    fn no_marker_publishes_raw_frame() {
        let source = Arc::new(StillSource::from_image(RgbImage::new(1, 1)));
        let (p, output) = pipeline(source, Box::new(Fixed(None)), AlertSender::disabled(), 0);

        let frame = teal_frame();
        assert_eq!(p.process(&frame), FrameOutcome::Unmarked);
        let published = output.snapshot().unwrap();
        assert_eq!(published.verdict, None);
        assert_eq!(published.image, frame.image);
    }

    #[test]
    fn empty_payload_counts_as_no_marker() {
        let detector = Fixed(Some(square("", 10.0, 10.0, 90.0, 90.0)));
        let source = Arc::new(StillSource::from_image(RgbImage::new(1, 1)));
        let (p, output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 0);

        assert_eq!(p.process(&teal_frame()), FrameOutcome::Unmarked);
        assert_eq!(output.snapshot().unwrap().verdict, None);
    }

    #[test]
    fn degenerate_corners_publish_raw_frame() {
        let detector = Fixed(Some(square("gate-1", 20.0, 20.0, 20.5, 20.5)));
        let source = Arc::new(StillSource::from_image(RgbImage::new(1, 1)));
        let (p, output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 0);

        assert_eq!(p.process(&teal_frame()), FrameOutcome::Unmarked);
        assert_eq!(output.snapshot().unwrap().verdict, None);
    }

    #[test]
    fn persistent_detector_failure_stops_loop() {
        let running = Arc::new(AtomicBool::new(true));
        let detector = Scripted {
            pattern: vec![true],
            calls: Arc::new(AtomicUsize::new(0)),
            stop_after: usize::MAX,
            running: Arc::clone(&running),
        };
        let source = Arc::new(Endless(AtomicU64::new(0)));
        let (p, output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 3);

        assert_eq!(
            p.run(&running),
            Err(PipelineError::DetectorFailing { consecutive: 3 })
        );
        // Raw frames are still published while the detector fails.
        assert!(output.snapshot().is_some());
    }

    #[test]
    fn intermittent_failures_do_not_stop_loop() {
        let running = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Scripted {
            pattern: vec![true, true, false],
            calls: Arc::clone(&calls),
            stop_after: 30,
            running: Arc::clone(&running),
        };
        let source = Arc::new(Endless(AtomicU64::new(0)));
        let (p, _output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 3);

        assert_eq!(p.run(&running), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn same_frame_is_processed_once() {
        let running = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let detector = Scripted {
            pattern: vec![false],
            calls: Arc::clone(&calls),
            stop_after: usize::MAX,
            running: Arc::new(AtomicBool::new(true)),
        };
        let source = Arc::new(StillSource::from_image(RgbImage::new(16, 16)));
        source.start().unwrap();
        let (p, _output) = pipeline(source, Box::new(detector), AlertSender::disabled(), 0);

        let handle = {
            let running = Arc::clone(&running);
            thread::spawn(move || p.run(&running))
        };
        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settings_follow_config() {
        let settings = PipelineSettings::from(&PipelineConfig::default());
        assert_eq!(settings.idle_sleep, Duration::from_millis(10));
        assert_eq!(settings.max_consecutive_failures, 100);
    }
}
