//! Time source used by every polling loop in the crate.
//!
//! Child-process polling, the synthetic format ramp and the post-mutation
//! settle delay all go through a [`Clock`] so that their intervals come from
//! configuration and tests can drive them without sleeping for real.
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A fixed-interval ticker over a [`Clock`].
#[derive(Clone)]
pub struct Ticker {
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Blocks until the next tick.
    pub fn tick(&self) {
        self.clock.sleep(self.interval);
    }
}
