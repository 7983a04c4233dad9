// VNA sweep triggering. The analyzer is not on this serial bus; its vendor
// software arms a sweep on a hotkey, so the trigger is an OS-level keypress
// injection. Fire-and-forget: there is no acknowledgment to wait for.

use std::process::Command;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(test)]
use std::sync::Arc;

use tracing::{debug, warn};

pub trait SweepTrigger: Send + Sync {
    fn trigger(&self);
}

/// Injects a key event via `xdotool`.
pub struct KeypressTrigger {
    key: String,
}

impl KeypressTrigger {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl SweepTrigger for KeypressTrigger {
    fn trigger(&self) {
        match Command::new("xdotool").args(["key", &self.key]).status() {
            Ok(status) if status.success() => {
                debug!("VNA sweep triggered via {}", self.key);
            }
            Ok(status) => warn!("xdotool exited with {}", status),
            Err(e) => warn!("failed to trigger VNA sweep with {}: {}", self.key, e),
        }
    }
}

/// Counts invocations; the test double.
#[cfg(test)]
#[derive(Default)]
pub struct CountingTrigger {
    pub count: Arc<AtomicU32>,
}

#[cfg(test)]
impl SweepTrigger for CountingTrigger {
    fn trigger(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
