//! Worker load: the share of wall time spent outside the poll wait.
//!
//! Load is measured per one-second window and kept in two rings: the last
//! 60 seconds and the last 60 minutes.

use std::time::{Duration, Instant};

use serde::Serialize;

const WINDOW: Duration = Duration::from_secs(1);
const RING: usize = 60;

/// Load percentages, 0 to 100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    pub last_second: u8,
    pub last_minute: u8,
    pub last_hour: u8,
}

#[derive(Debug, Clone)]
struct Ring {
    samples: [u8; RING],
    len: usize,
    next: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            samples: [0; RING],
            len: 0,
            next: 0,
        }
    }

    /// Push a sample; true when the ring has just wrapped around.
    fn push(&mut self, sample: u8) -> bool {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % RING;
        self.len = (self.len + 1).min(RING);
        self.next == 0
    }

    fn average(&self) -> u8 {
        if self.len == 0 {
            return 0;
        }
        let sum: u32 = self.samples[..self.len].iter().map(|&s| s as u32).sum();
        (sum / self.len as u32) as u8
    }
}

#[derive(Debug, Clone)]
pub struct WorkerLoad {
    window_start: Instant,
    wait_start: Option<Instant>,
    waited: Duration,
    last_second: u8,
    minute: Ring,
    hour: Ring,
}

impl WorkerLoad {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            wait_start: None,
            waited: Duration::ZERO,
            last_second: 0,
            minute: Ring::new(),
            hour: Ring::new(),
        }
    }

    /// The worker is about to block in the poller.
    pub fn about_to_wait(&mut self, now: Instant) {
        self.wait_start = Some(now);
    }

    /// The worker woke up and is about to handle events.
    pub fn about_to_work(&mut self, now: Instant) {
        if let Some(start) = self.wait_start.take() {
            self.waited += now.saturating_duration_since(start);
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < WINDOW {
            return;
        }

        let busy = elapsed.saturating_sub(self.waited);
        let percent = (busy.as_micros() * 100 / elapsed.as_micros().max(1)).min(100) as u8;
        self.last_second = percent;
        if self.minute.push(percent) {
            self.hour.push(self.minute.average());
        }

        self.window_start = now;
        self.waited = Duration::ZERO;
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            last_second: self.last_second,
            last_minute: self.minute.average(),
            last_hour: self.hour.average(),
        }
    }
}
