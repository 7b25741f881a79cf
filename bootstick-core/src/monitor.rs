//! Hotplug watching by periodic rescans.
//!
//! A [`DeviceMonitor`] owns one background thread while started. Each start
//! hands out a fresh [`Subscription`] whose first events describe the devices
//! already present; the stream ends when the monitor is stopped.
use crate::clock::Ticker;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::platform::DeviceSource;
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Added(BlockDevice),
    /// The device at this path disappeared.
    Removed(PathBuf),
}

/// The receiving end of a monitor run.
pub struct Subscription {
    events: Receiver<DeviceEvent>,
}

impl Subscription {
    /// Waits up to `timeout` for the next event. `None` on timeout or once
    /// the monitor has stopped.
    pub fn next_timeout(&self, timeout: Duration) -> Option<DeviceEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Iterator for Subscription {
    type Item = DeviceEvent;

    fn next(&mut self) -> Option<DeviceEvent> {
        self.events.recv().ok()
    }
}

fn diff(previous: &[BlockDevice], current: &[BlockDevice]) -> Vec<DeviceEvent> {
    let removed = previous
        .iter()
        .filter(|old| !current.iter().any(|d| d.path == old.path))
        .map(|old| DeviceEvent::Removed(old.path.clone()));
    let added = current
        .iter()
        .filter(|new| !previous.iter().any(|d| d.path == new.path))
        .map(|new| DeviceEvent::Added(new.clone()));
    removed.chain(added).collect()
}

fn watch(source: &dyn DeviceSource, ticker: &Ticker, shutdown: &AtomicBool, tx: &Sender<DeviceEvent>) {
    let mut known: Vec<BlockDevice> = Vec::new();
    while !shutdown.load(Ordering::SeqCst) {
        match source.devices() {
            Ok(current) => {
                for event in diff(&known, &current) {
                    debug!("Device event: {event:?}");
                    if tx.send(event).is_err() {
                        debug!("Subscriber gone; monitor thread exiting");
                        return;
                    }
                }
                known = current;
            }
            Err(e) => warn!("Device rescan failed: {e}"),
        }
        ticker.tick();
    }
}

pub struct DeviceMonitor {
    source: Arc<dyn DeviceSource>,
    ticker: Ticker,
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl DeviceMonitor {
    pub fn new(source: Arc<dyn DeviceSource>, ticker: Ticker) -> Self {
        Self {
            source,
            ticker,
            shutdown: Arc::new(AtomicBool::new(false)),
            join: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.is_some()
    }

    /// Starts rescanning every tick. Fails if already started.
    pub fn start(&mut self) -> Result<Subscription> {
        if self.is_running() {
            return Err(Error::Configuration("device monitor is already running".to_string()));
        }
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        self.shutdown = shutdown.clone();
        let source = self.source.clone();
        let ticker = self.ticker.clone();
        let join = thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || watch(source.as_ref(), &ticker, &shutdown, &tx))
            .map_err(|e| Error::io("device-monitor", e))?;
        self.join = Some(join);
        Ok(Subscription { events: rx })
    }

    /// Stops the background thread and waits for it. The subscription
    /// handed out by the matching `start` ends.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            if handle.join().is_err() {
                warn!("Device monitor thread panicked");
            }
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
