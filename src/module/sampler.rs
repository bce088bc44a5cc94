//! Real-Time Sampler
//!
//! Samples the frame source on a fixed period while running and publishes the
//! boxes of each cycle. At most one cycle is ever in flight, ticks that come
//! due while a cycle runs are dropped, not queued.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::backend::{BoundingBox, BoxDetector};
use super::classes::CropType;
use super::vision::camera::FrameSource;
use super::vision::preprocess::Preprocessor;

/// Commands to a sampler worker.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveCommand {
    Off,
}

/// One published box set.
///
#[derive(Debug, Clone, PartialEq)]
pub struct BoxUpdate {
    /// Increases with every publication, stop included.
    pub cycle: u64,
    pub captured_at: DateTime<Utc>,
    pub boxes: Vec<BoundingBox>,
}

/// Sampler counters.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub frames_processed: u64,
    pub frames_with_detections: u64,
    pub ticks_dropped: u64,
    pub tick_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    frames_with_detections: AtomicU64,
    ticks_dropped: AtomicU64,
    tick_failures: AtomicU64,
}

struct Control {
    running: bool,
    // Bumped on every start and stop, a cycle only publishes for its own epoch.
    epoch: u64,
    cancel: Option<Sender<LiveCommand>>,
    workers: Vec<JoinHandle<()>>,
}

struct Published {
    cycle: u64,
    boxes: Vec<BoundingBox>,
    subscribers: Vec<Sender<BoxUpdate>>,
}

struct Shared {
    detector: Arc<dyn BoxDetector>,
    preprocessor: Preprocessor,
    frames: Mutex<Box<dyn FrameSource>>,
    period: Duration,
    // Lock order: control, then published.
    control: Mutex<Control>,
    published: Mutex<Published>,
    in_flight: AtomicBool,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the in-flight flag when the cycle ends, whatever the outcome.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn run(&self, epoch: u64, crop: Option<CropType>, rx: Receiver<LiveCommand>) {
        let mut next = Instant::now() + self.period;
        loop {
            let wait = next.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(LiveCommand::Off) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => (),
            }
            self.tick(epoch, crop);

            next += self.period;
            let now = Instant::now();
            while next <= now {
                self.counters.ticks_dropped.fetch_add(1, Ordering::SeqCst);
                log::debug!("Live tick dropped, cycle overran the period");
                next += self.period;
            }
        }
        log::debug!("Live worker {} finished", epoch);
    }

    fn tick(&self, epoch: u64, crop: Option<CropType>) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.counters.ticks_dropped.fetch_add(1, Ordering::SeqCst);
            log::debug!("Live tick dropped, previous cycle in flight");
            return;
        }
        let _guard = InFlight(&self.in_flight);

        let captured_at = Utc::now();
        match self.cycle(crop) {
            Ok(boxes) => {
                self.counters.frames_processed.fetch_add(1, Ordering::SeqCst);
                if !boxes.is_empty() {
                    self.counters
                        .frames_with_detections
                        .fetch_add(1, Ordering::SeqCst);
                }
                self.publish(epoch, captured_at, boxes);
            }
            Err(e) => {
                // Previous boxes stay up, the next tick retries.
                self.counters.tick_failures.fetch_add(1, Ordering::SeqCst);
                log::warn!("Live tick failed: {}", e);
            }
        }
    }

    /// Capture, preprocess and detect. The tensor is released before returning.
    fn cycle(&self, crop: Option<CropType>) -> Result<Vec<BoundingBox>, Box<dyn std::error::Error>> {
        let frame = lock(&self.frames).capture()?;
        let tensor = self
            .preprocessor
            .preprocess(&frame, &self.detector.contract())?;
        Ok(self.detector.detect_boxes(tensor, crop)?)
    }

    fn publish(&self, epoch: u64, captured_at: DateTime<Utc>, boxes: Vec<BoundingBox>) {
        let control = lock(&self.control);
        if !control.running || control.epoch != epoch {
            log::debug!("Discarding {} boxes of a stopped session", boxes.len());
            return;
        }
        let mut published = lock(&self.published);
        published.cycle += 1;
        published.boxes = boxes;
        let update = BoxUpdate {
            cycle: published.cycle,
            captured_at,
            boxes: published.boxes.clone(),
        };
        published
            .subscribers
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Live detection loop over a frame source.
///
pub struct LiveSampler {
    shared: Arc<Shared>,
}

impl LiveSampler {
    pub fn new(
        detector: Arc<dyn BoxDetector>,
        frames: Box<dyn FrameSource>,
        preprocessor: Preprocessor,
        period: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                detector,
                preprocessor,
                frames: Mutex::new(frames),
                period,
                control: Mutex::new(Control {
                    running: false,
                    epoch: 0,
                    cancel: None,
                    workers: vec![],
                }),
                published: Mutex::new(Published {
                    cycle: 0,
                    boxes: vec![],
                    subscribers: vec![],
                }),
                in_flight: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Idle -> Running. Returns false when already running.
    pub fn start(&self, crop: Option<CropType>) -> bool {
        let mut control = lock(&self.shared.control);
        if control.running {
            log::debug!("Live sampler already running");
            return false;
        }
        control.running = true;
        control.epoch += 1;
        let epoch = control.epoch;

        let (tx, rx) = mpsc::channel();
        control.cancel = Some(tx);
        control.workers.retain(|h| !h.is_finished());
        let shared = Arc::clone(&self.shared);
        control
            .workers
            .push(thread::spawn(move || shared.run(epoch, crop, rx)));

        log::info!(
            "Live sampler started, every {} ms, crop {:?}",
            self.shared.period.as_millis(),
            crop
        );
        true
    }

    /// Running -> Idle. Safe from any state.
    ///
    /// A cycle already in flight may finish but its boxes are discarded.
    pub fn stop(&self) {
        let mut control = lock(&self.shared.control);
        control.epoch += 1;
        if let Some(tx) = control.cancel.take() {
            let _ = tx.send(LiveCommand::Off);
        }
        let was_running = std::mem::replace(&mut control.running, false);

        let mut published = lock(&self.shared.published);
        published.boxes.clear();
        if was_running {
            published.cycle += 1;
            let update = BoxUpdate {
                cycle: published.cycle,
                captured_at: Utc::now(),
                boxes: vec![],
            };
            published
                .subscribers
                .retain(|tx| tx.send(update.clone()).is_ok());
            log::info!("Live sampler stopped");
        }
    }

    /// Stops and waits for every worker to exit.
    pub fn shutdown(&self) {
        self.stop();
        let workers = std::mem::take(&mut lock(&self.shared.control).workers);
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Live worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.control).running
    }

    /// Receives every published box set from now on.
    pub fn subscribe(&self) -> Receiver<BoxUpdate> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.published).subscribers.push(tx);
        rx
    }

    pub fn current_boxes(&self) -> Vec<BoundingBox> {
        lock(&self.shared.published).boxes.clone()
    }

    pub fn stats(&self) -> SamplerStats {
        let c = &self.shared.counters;
        SamplerStats {
            frames_processed: c.frames_processed.load(Ordering::SeqCst),
            frames_with_detections: c.frames_with_detections.load(Ordering::SeqCst),
            ticks_dropped: c.ticks_dropped.load(Ordering::SeqCst),
            tick_failures: c.tick_failures.load(Ordering::SeqCst),
        }
    }
}

impl Drop for LiveSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::error::InferenceError;
    use crate::module::vision::camera::StillFrames;
    use crate::module::vision::preprocess::{
        InputContract, Layout, Normalization, ResizePolicy, Tensor,
    };
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::AtomicUsize;

    const SMALL: InputContract = InputContract {
        size: 16,
        resize: ResizePolicy::Stretch,
        normalization: Normalization::Unit,
        layout: Layout::Nhwc,
    };

    fn bbox(label: &str) -> BoundingBox {
        BoundingBox {
            x: 0.1,
            y: 0.1,
            width: 0.2,
            height: 0.2,
            label: label.into(),
            confidence: 0.9,
        }
    }

    /// Sleeps for `delay`, tracks concurrency, returns `calls` boxes on call n.
    #[derive(Default)]
    struct SlowDetector {
        delay: Duration,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl BoxDetector for SlowDetector {
        fn contract(&self) -> InputContract {
            SMALL
        }

        fn detect_boxes(
            &self,
            _tensor: Tensor,
            _crop_filter: Option<CropType>,
        ) -> Result<Vec<BoundingBox>, InferenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok((0..call.min(3)).map(|i| bbox(&format!("{}-{}", call, i))).collect())
        }
    }

    /// Blocks inside inference until released.
    struct GatedDetector {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl BoxDetector for GatedDetector {
        fn contract(&self) -> InputContract {
            SMALL
        }

        fn detect_boxes(
            &self,
            _tensor: Tensor,
            _crop_filter: Option<CropType>,
        ) -> Result<Vec<BoundingBox>, InferenceError> {
            let _ = lock(&self.entered).send(());
            let _ = lock(&self.release).recv_timeout(Duration::from_secs(5));
            Ok(vec![bbox("late")])
        }
    }

    fn frames() -> Box<dyn FrameSource> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, image::Rgb([30, 90, 30])));
        Box::new(StillFrames::repeating(vec![img]))
    }

    fn sampler(detector: Arc<dyn BoxDetector>, period_ms: u64) -> (LiveSampler, Preprocessor) {
        let pre = Preprocessor::new();
        let sampler = LiveSampler::new(
            detector,
            frames(),
            pre.clone(),
            Duration::from_millis(period_ms),
        );
        (sampler, pre)
    }

    #[test]
    fn no_overlapping_cycles_test() {
        let det = Arc::new(SlowDetector {
            delay: Duration::from_millis(60),
            ..Default::default()
        });
        let (live, pre) = sampler(det.clone(), 15);
        assert!(live.start(None));
        thread::sleep(Duration::from_millis(250));
        // Restart while a cycle is likely in flight.
        live.stop();
        assert!(live.start(Some(CropType::Tomato)));
        thread::sleep(Duration::from_millis(250));
        live.shutdown();

        assert_eq!(det.max_active.load(Ordering::SeqCst), 1);
        assert!(det.calls.load(Ordering::SeqCst) >= 2);
        assert!(live.stats().ticks_dropped > 0);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn stop_discards_in_flight_result_test() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let det = Arc::new(GatedDetector {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let (live, pre) = sampler(det, 5);
        let updates = live.subscribe();
        live.start(None);
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        live.stop();
        release_tx.send(()).unwrap();
        live.shutdown();

        assert!(live.current_boxes().is_empty());
        let received: Vec<BoxUpdate> = updates.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(received[0].boxes.is_empty());
        assert_eq!(live.stats().frames_processed, 1);
        assert_eq!(pre.ledger().live(), 0);
    }

    #[test]
    fn reentrant_start_test() {
        let det = Arc::new(SlowDetector::default());
        let (live, _) = sampler(det, 50);
        assert!(live.start(None));
        assert!(!live.start(None));
        assert!(live.is_running());
        assert_eq!(lock(&live.shared.control).workers.len(), 1);
        live.shutdown();
        assert!(!live.is_running());
        // Stop is safe from any state.
        live.stop();
        live.shutdown();
    }

    #[test]
    fn boxes_are_replaced_test() {
        let det = Arc::new(SlowDetector::default());
        let (live, _) = sampler(det, 10);
        let updates = live.subscribe();
        live.start(None);
        let first = updates.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = updates.recv_timeout(Duration::from_secs(5)).unwrap();
        live.shutdown();

        assert_eq!(first.boxes.len(), 1);
        assert_eq!(first.boxes[0].label, "1-0");
        // The second set replaces the first, nothing carried over.
        assert_eq!(second.boxes.len(), 2);
        assert!(second.boxes.iter().all(|b| b.label.starts_with("2-")));
        assert!(second.cycle > first.cycle);
        assert!(second.captured_at >= first.captured_at);
    }

    #[test]
    fn failed_ticks_keep_previous_boxes_test() {
        let det = Arc::new(SlowDetector::default());
        let img = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let live = LiveSampler::new(
            det,
            Box::new(StillFrames::once(vec![img])),
            Preprocessor::new(),
            Duration::from_millis(5),
        );
        let updates = live.subscribe();
        live.start(None);
        updates.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(60));

        assert_eq!(live.current_boxes().len(), 1);
        let stats = live.stats();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.frames_with_detections, 1);
        assert!(stats.tick_failures > 0);
        live.shutdown();
        assert!(live.current_boxes().is_empty());
    }
}
