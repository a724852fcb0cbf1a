use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chunkflow_protocol::{SessionSnapshot, UploadState};

/// Default minimum progress delta (percentage points) between emissions.
const DEFAULT_MIN_STEP: f64 = 2.0;

/// Default maximum silence while progress is moving.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Listener-side sampling of session snapshots.
///
/// Orchestrators notify on every chunk completion, which is dense for small
/// chunk sizes. A listener wraps its sink with a throttle and forwards only
/// the snapshots for which [`should_emit`](Self::should_emit) returns `true`:
/// the first one, every state change, completion (100%), a jump of at least
/// `min_step`, or any change after `interval` of silence.
pub struct ProgressThrottle {
    inner: Mutex<ThrottleInner>,
    min_step: f64,
    interval: Duration,
}

#[derive(Default)]
struct ThrottleInner {
    last_progress: Option<f64>,
    last_state: Option<UploadState>,
    last_emit: Option<Instant>,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ProgressThrottle {
    /// Creates a throttle.
    ///
    /// - `min_step`: percentage points that always trigger an emission (default 2.0).
    /// - `interval`: maximum silence while progress changes (default 500 ms).
    pub fn new(min_step: Option<f64>, interval: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(ThrottleInner::default()),
            min_step: min_step.unwrap_or(DEFAULT_MIN_STEP),
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
        }
    }

    /// Decides whether `snapshot` should reach the sink, recording it if so.
    pub fn should_emit(&self, snapshot: &SessionSnapshot) -> bool {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let emit = match (s.last_progress, s.last_state, s.last_emit) {
            (Some(last_progress), Some(last_state), Some(last_emit)) => {
                let delta = snapshot.progress - last_progress;
                last_state != snapshot.state
                    || (snapshot.progress >= 100.0 && last_progress < 100.0)
                    || delta >= self.min_step
                    || (delta > 0.0 && now.duration_since(last_emit) >= self.interval)
            }
            _ => true,
        };

        if emit {
            s.last_progress = Some(snapshot.progress);
            s.last_state = Some(snapshot.state);
            s.last_emit = Some(now);
        }
        emit
    }

    /// Forgets the last emission, e.g. after a restart.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *s = ThrottleInner::default();
    }
}
