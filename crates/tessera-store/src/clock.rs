use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct EpochState {
    current: Option<u64>,
    last: u64,
}

/// Frame-scoped "current timestamp".
///
/// The timestamp is read from the clock on first use within a frame and then
/// held until [`FrameEpoch::reset`] marks the frame boundary.
///
/// # Rules
///
/// - Every frame gets a timestamp strictly greater than the previous frame's,
///   even when the clock has not moved, so frame-scoped validity always
///   expires at a boundary.
/// - Timestamps are never zero; zero means "not stamped".
pub struct FrameEpoch {
    clock: Arc<dyn Clock>,
    state: Mutex<EpochState>,
}

impl FrameEpoch {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(EpochState {
                current: None,
                last: 0,
            }),
        }
    }

    /// Timestamp of the current frame.
    pub fn now(&self) -> u64 {
        let mut state = self.state.lock().expect("epoch mutex poisoned");
        if let Some(current) = state.current {
            return current;
        }
        let wall = self.clock.now_ms();
        let next = wall.max(state.last + 1);
        state.current = Some(next);
        state.last = next;
        next
    }

    /// Mark a frame boundary.
    pub fn reset(&self) {
        self.state.lock().expect("epoch mutex poisoned").current = None;
    }
}

impl std::fmt::Debug for FrameEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.state.lock().map(|s| s.current).unwrap_or(None);
        f.debug_struct("FrameEpoch").field("current", &current).finish()
    }
}
