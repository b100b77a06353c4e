//! Monotonic timestamps and rolling frame-timing statistics.
//!
//! Every per-frame measurement in the engine flows through here: decode time,
//! upload + draw time, and the inter-present interval the VSync pacing checks
//! are built on. Windows are fixed-size rings, so recording a sample on the
//! render hot path never allocates.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Process-relative monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity ring of duration samples, in microseconds.
#[derive(Debug)]
pub struct RollingWindow {
    samples: Vec<u64>,
    head: usize,
    len: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            samples: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.record_us(sample.as_micros() as u64);
    }

    pub fn record_us(&mut self, us: u64) {
        self.samples[self.head] = us;
        self.head = (self.head + 1) % self.samples.len();
        self.len = (self.len + 1).min(self.samples.len());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mean_us(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let sum: u64 = self.iter().sum();
        sum as f64 / self.len as f64
    }

    /// Nearest-rank percentile, `p` in [0, 100].
    pub fn percentile_us(&self, p: f64) -> u64 {
        if self.len == 0 {
            return 0;
        }
        let mut sorted: Vec<u64> = self.iter().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    pub fn max_us(&self) -> u64 {
        self.iter().max().unwrap_or(0)
    }

    fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        let cap = self.samples.len();
        let start = (self.head + cap - self.len) % cap;
        (0..self.len).map(move |i| self.samples[(start + i) % cap])
    }

    pub fn snapshot(&self) -> WindowStats {
        WindowStats {
            count: self.len as u64,
            mean_us: self.mean_us(),
            p50_us: self.percentile_us(50.0),
            p90_us: self.percentile_us(90.0),
            p99_us: self.percentile_us(99.0),
            max_us: self.max_us(),
        }
    }
}

/// Point-in-time summary of one rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Per-stream playback counters plus the timing windows behind them.
#[derive(Debug)]
pub struct StreamMetrics {
    pub frames_decoded: u64,
    pub frames_presented: u64,
    /// Present iterations that re-used the previously held slot.
    pub frames_repeated: u64,
    pub hw_failures: u64,
    pub fallbacks: u64,
    pub decode: RollingWindow,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            frames_decoded: 0,
            frames_presented: 0,
            frames_repeated: 0,
            hw_failures: 0,
            fallbacks: 0,
            decode: RollingWindow::new(600),
        }
    }

    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_decoded: self.frames_decoded,
            frames_presented: self.frames_presented,
            frames_repeated: self.frames_repeated,
            hw_failures: self.hw_failures,
            fallbacks: self.fallbacks,
            decode: self.decode.snapshot(),
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub frames_decoded: u64,
    pub frames_presented: u64,
    pub frames_repeated: u64,
    pub hw_failures: u64,
    pub fallbacks: u64,
    pub decode: WindowStats,
}

/// Render-side timing: one window for upload+draw, one for the interval
/// between consecutive presents.
#[derive(Debug)]
pub struct RenderMetrics {
    pub render: RollingWindow,
    pub present_interval: RollingWindow,
    pub vsyncs_missed: u64,
    last_present: Option<Instant>,
}

impl RenderMetrics {
    pub fn new() -> Self {
        Self {
            render: RollingWindow::new(600),
            present_interval: RollingWindow::new(600),
            vsyncs_missed: 0,
            last_present: None,
        }
    }

    /// Record a completed present. `period` is the display refresh period;
    /// intervals beyond 1.5x of it count as a missed VSync.
    pub fn on_present(&mut self, at: Instant, period: Duration) {
        if let Some(prev) = self.last_present {
            let interval = at - prev;
            self.present_interval.record(interval);
            if interval > period + period / 2 {
                self.vsyncs_missed += 1;
            }
        }
        self.last_present = Some(at);
    }

    pub fn snapshot(&self) -> RenderStats {
        RenderStats {
            render: self.render.snapshot(),
            present_interval: self.present_interval.snapshot(),
            vsyncs_missed: self.vsyncs_missed,
        }
    }
}

impl Default for RenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderStats {
    pub render: WindowStats,
    pub present_interval: WindowStats,
    pub vsyncs_missed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_wraps_and_keeps_recent() {
        let mut w = RollingWindow::new(4);
        for us in [10, 20, 30, 40, 50, 60] {
            w.record_us(us);
        }
        assert_eq!(w.len(), 4);
        // Oldest two (10, 20) fell out of the ring.
        assert_eq!(w.mean_us(), 45.0);
        assert_eq!(w.max_us(), 60);
    }

    #[test]
    fn percentiles_on_known_distribution() {
        let mut w = RollingWindow::new(100);
        for us in 1..=100u64 {
            w.record_us(us);
        }
        assert_eq!(w.percentile_us(0.0), 1);
        assert_eq!(w.percentile_us(50.0), 51);
        assert_eq!(w.percentile_us(99.0), 99);
        assert_eq!(w.percentile_us(100.0), 100);
    }

    #[test]
    fn empty_window_is_all_zero() {
        let w = RollingWindow::new(8);
        assert_eq!(w.mean_us(), 0.0);
        assert_eq!(w.percentile_us(99.0), 0);
        assert_eq!(w.max_us(), 0);
    }

    #[test]
    fn present_intervals_detect_missed_vsync() {
        let mut m = RenderMetrics::new();
        let period = Duration::from_micros(16_667);
        let t0 = Instant::now();
        m.on_present(t0, period);
        m.on_present(t0 + period, period);
        m.on_present(t0 + period * 2, period);
        assert_eq!(m.vsyncs_missed, 0);
        // A 2-period gap is one missed flip.
        m.on_present(t0 + period * 4, period);
        assert_eq!(m.vsyncs_missed, 1);
        assert_eq!(m.present_interval.len(), 3);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
