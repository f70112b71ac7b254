//! Dedicated acquisition thread: open → read → push into the frame slot,
//! retrying failures with bounded exponential backoff.
//!
//! After `max_attempts` consecutive failures the thread closes the slot with
//! [`CaptureError::Exhausted`] and exits. Nothing restarts it implicitly; the
//! owner has to spawn a new acquisition.

use crate::slot::{Closed, FrameSlot};
use crate::source::{CaptureError, FrameSource};
use secureface_core::params::CameraSettings;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often a sleeping backoff re-checks the stop flag.
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Blocking read timeout for one frame.
    pub frame_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Opens a frame source for the given settings.
pub type SourceOpener =
    Box<dyn FnMut(&CameraSettings) -> Result<Box<dyn FrameSource>, CaptureError> + Send>;

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub captured: AtomicU64,
    pub failures: AtomicU64,
    pub reopens: AtomicU64,
}

#[derive(Default)]
struct Control {
    stop: AtomicBool,
    reopen: Mutex<Option<CameraSettings>>,
}

impl Control {
    fn take_reopen(&self) -> Option<CameraSettings> {
        self.reopen.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `total`, returning early if stop is requested.
    fn sleep(&self, total: Duration) {
        let mut left = total;
        while !left.is_zero() && !self.stopped() {
            let step = left.min(STOP_POLL);
            std::thread::sleep(step);
            left -= step;
        }
    }
}

/// Handle to a running acquisition thread.
pub struct Acquisition {
    control: Arc<Control>,
    thread: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl Acquisition {
    pub fn spawn(
        settings: CameraSettings,
        opener: SourceOpener,
        slot: Arc<FrameSlot>,
        policy: RetryPolicy,
        stats: Arc<CaptureStats>,
    ) -> std::io::Result<Self> {
        let control = Arc::new(Control::default());
        let worker = Worker {
            settings,
            opener,
            slot,
            policy,
            stats,
            control: Arc::clone(&control),
        };
        let thread = std::thread::Builder::new()
            .name("secureface-acquire".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Close the current source and open one with `settings` at the next
    /// acquisition boundary.
    pub fn request_reopen(&self, settings: CameraSettings) {
        *self.control.reopen.lock().unwrap_or_else(|p| p.into_inner()) = Some(settings);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal stop and wait for the thread. Returns how it ended.
    pub fn stop(mut self) -> Result<(), CaptureError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), CaptureError> {
        self.control.stop.store(true, Ordering::SeqCst);
        match self.thread.take() {
            Some(t) => t
                .join()
                .unwrap_or_else(|_| Err(CaptureError::CaptureFailed("acquisition thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Worker {
    settings: CameraSettings,
    opener: SourceOpener,
    slot: Arc<FrameSlot>,
    policy: RetryPolicy,
    stats: Arc<CaptureStats>,
    control: Arc<Control>,
}

impl Worker {
    fn run(mut self) -> Result<(), CaptureError> {
        let result = self.acquire();
        match &result {
            Ok(()) => {
                tracing::info!("acquisition stopped");
                self.slot.close(Closed::Stopped);
            }
            Err(e) => {
                tracing::error!(error = %e, source = %self.settings.source, "capture failed permanently");
                self.slot.close(Closed::Failed(e.clone()));
            }
        }
        result
    }

    fn acquire(&mut self) -> Result<(), CaptureError> {
        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut failures = 0u32;

        while !self.control.stopped() {
            if let Some(next) = self.control.take_reopen() {
                tracing::info!(source = %next.source, width = next.width, height = next.height, fps = next.fps, "re-opening frame source");
                source = None;
                failures = 0;
                self.settings = next;
                self.stats.reopens.fetch_add(1, Ordering::Relaxed);
            }

            if source.is_none() {
                match (self.opener)(&self.settings) {
                    Ok(src) => {
                        tracing::info!(source = %src.describe(), "frame source open");
                        source = Some(src);
                    }
                    Err(e) => {
                        self.retry_or_give_up(&mut failures, e)?;
                        continue;
                    }
                }
            }
            let Some(src) = source.as_mut() else {
                continue;
            };

            match src.next_frame(self.policy.frame_timeout) {
                Ok(frame) => {
                    failures = 0;
                    self.stats.captured.fetch_add(1, Ordering::Relaxed);
                    if self.slot.push(Arc::new(frame)) {
                        tracing::trace!("undelivered frame replaced");
                    }
                }
                // A stalled stream keeps its handle; anything else re-opens.
                Err(e @ CaptureError::Timeout(_)) => self.retry_or_give_up(&mut failures, e)?,
                Err(e) => {
                    source = None;
                    self.retry_or_give_up(&mut failures, e)?;
                }
            }
        }

        Ok(())
    }

    fn retry_or_give_up(&self, failures: &mut u32, err: CaptureError) -> Result<(), CaptureError> {
        *failures += 1;
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        if *failures >= self.policy.max_attempts {
            return Err(CaptureError::Exhausted {
                attempts: *failures,
                last: err.to_string(),
            });
        }

        let delay = self.policy.backoff(*failures);
        tracing::warn!(
            attempt = *failures,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "capture failed, retrying"
        );
        self.control.sleep(delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Take;
    use chrono::Utc;
    use image::RgbImage;
    use secureface_core::{ChannelOrder, Frame};
    use std::sync::atomic::AtomicU32;

    struct Counting {
        seq: u64,
        fail_after: Option<u64>,
    }

    impl FrameSource for Counting {
        fn next_frame(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(1));
            self.seq += 1;
            if self.fail_after.is_some_and(|n| self.seq > n) {
                return Err(CaptureError::CaptureFailed("unplugged".into()));
            }
            Ok(Frame {
                image: RgbImage::new(4, 4),
                order: ChannelOrder::Bgr,
                camera_id: 1,
                sequence: self.seq,
                captured_at: Utc::now(),
            })
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            frame_timeout: Duration::from_millis(20),
        }
    }

    fn wait_for_frame(slot: &FrameSlot) -> Arc<Frame> {
        match slot.take(Duration::from_secs(5)) {
            Take::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=6).map(|a| p.backoff(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.backoff(200), Duration::from_secs(1));
    }

    #[test]
    fn test_open_retries_then_streams() {
        let opens = Arc::new(AtomicU32::new(0));
        let opener: SourceOpener = {
            let opens = Arc::clone(&opens);
            Box::new(move |_| {
                if opens.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CaptureError::DeviceBusy)
                } else {
                    Ok(Box::new(Counting { seq: 0, fail_after: None }))
                }
            })
        };
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(CaptureStats::default());
        let acq = Acquisition::spawn(
            CameraSettings::default(),
            opener,
            Arc::clone(&slot),
            fast_policy(5),
            Arc::clone(&stats),
        )
        .unwrap();

        wait_for_frame(&slot);
        assert_eq!(stats.failures.load(Ordering::SeqCst), 2);
        assert!(acq.stop().is_ok());
        assert_eq!(slot.closed(), Some(Closed::Stopped));
    }

    #[test]
    fn test_exhaustion_surfaces_capture_error() {
        let opener: SourceOpener = Box::new(|_| Err(CaptureError::DeviceNotFound("/dev/video9".into())));
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(CaptureStats::default());
        let acq = Acquisition::spawn(
            CameraSettings::default(),
            opener,
            Arc::clone(&slot),
            fast_policy(3),
            Arc::clone(&stats),
        )
        .unwrap();

        match slot.take(Duration::from_secs(5)) {
            Take::Closed(Closed::Failed(CaptureError::Exhausted { attempts, .. })) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(acq.stop(), Err(CaptureError::Exhausted { attempts: 3, .. })));
        assert_eq!(stats.captured.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stream_failure_reopens_source() {
        let opens = Arc::new(AtomicU32::new(0));
        let opener: SourceOpener = {
            let opens = Arc::clone(&opens);
            Box::new(move |_| {
                opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Counting { seq: 0, fail_after: Some(3) }))
            })
        };
        let slot = Arc::new(FrameSlot::new());
        let acq = Acquisition::spawn(
            CameraSettings::default(),
            opener,
            Arc::clone(&slot),
            fast_policy(3),
            Arc::new(CaptureStats::default()),
        )
        .unwrap();

        // Each source yields 3 frames then fails once; the failure streak
        // never reaches the limit because a good frame resets it.
        for _ in 0..10 {
            wait_for_frame(&slot);
        }
        assert!(opens.load(Ordering::SeqCst) >= 2);
        assert!(acq.is_running());
        acq.stop().unwrap();
    }

    #[test]
    fn test_reopen_uses_new_settings() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let opener: SourceOpener = {
            let seen = Arc::clone(&seen);
            Box::new(move |s| {
                seen.lock().unwrap().push(s.source.clone());
                Ok(Box::new(Counting { seq: 0, fail_after: None }))
            })
        };
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(CaptureStats::default());
        let acq = Acquisition::spawn(
            CameraSettings::default(),
            opener,
            Arc::clone(&slot),
            fast_policy(3),
            Arc::clone(&stats),
        )
        .unwrap();
        wait_for_frame(&slot);

        acq.request_reopen(CameraSettings {
            source: "/dev/video4".into(),
            ..CameraSettings::default()
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stats.reopens.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        wait_for_frame(&slot);
        acq.stop().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("/dev/video0"));
        assert_eq!(seen.last().map(String::as_str), Some("/dev/video4"));
    }
}
