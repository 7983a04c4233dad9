use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Sweep the platform through an angle range, incrementing tilt.
    Tilt,
    /// Step a fixed raw step count per point, starting from home.
    Fill,
}

/// Parameters of one sweep. Validated before any hardware I/O and copied at
/// run start, so edits from the operator surface cannot touch a live run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestParameters {
    pub kind: TestKind,
    pub min_tilt_deg: f64,
    pub max_tilt_deg: f64,
    pub increment_deg: f64,
    /// Settling wait after each move, seconds.
    pub dwell_secs: f64,
    pub loops: u32,
    /// Wait for the VNA sweep to finish, seconds.
    pub vna_dwell_secs: f64,
    /// Extra wait after each point; 0 disables it.
    pub drain_delay_secs: f64,
    /// Raw steps per point in fill mode.
    pub step_increment: i32,
    pub export_dir: PathBuf,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            kind: TestKind::Tilt,
            min_tilt_deg: -15.0,
            max_tilt_deg: 15.0,
            increment_deg: 1.0,
            dwell_secs: 5.0,
            loops: 1,
            vna_dwell_secs: 3.0,
            drain_delay_secs: 0.0,
            step_increment: 520,
            export_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid test parameters: {reason}")]
pub struct InvalidParameters {
    pub reason: String,
}

impl TestParameters {
    pub fn validate(&self) -> Result<(), InvalidParameters> {
        let reject = |reason: &str| {
            Err(InvalidParameters { reason: reason.to_string() })
        };
        if !(-30.0..=30.0).contains(&self.min_tilt_deg) {
            return reject("minimum tilt must be within [-30, 30] degrees");
        }
        if !(-30.0..=30.0).contains(&self.max_tilt_deg) {
            return reject("maximum tilt must be within [-30, 30] degrees");
        }
        if self.min_tilt_deg >= self.max_tilt_deg {
            return reject("minimum tilt must be less than maximum tilt");
        }
        if !(0.1..=3.0).contains(&self.increment_deg) {
            return reject("angle increment must be within [0.1, 3.0] degrees");
        }
        if !(5.0..=60.0).contains(&self.dwell_secs) {
            return reject("dwell time must be within [5, 60] seconds");
        }
        if self.loops == 0 {
            return reject("number of loops must be at least 1");
        }
        if self.vna_dwell_secs < 0.0 {
            return reject("VNA dwell must not be negative");
        }
        if self.drain_delay_secs < 0.0 {
            return reject("drain delay must not be negative");
        }
        if self.kind == TestKind::Fill && self.step_increment == 0 {
            return reject("fill step increment must be nonzero");
        }
        Ok(())
    }

    /// Points visited per loop: floor((max - min) / increment) + 1.
    pub fn points_per_loop(&self) -> u32 {
        ((self.max_tilt_deg - self.min_tilt_deg) / self.increment_deg).floor() as u32 + 1
    }

    /// Target angles of one loop, min to max in increment steps.
    pub fn angles(&self) -> Vec<f64> {
        (0..self.points_per_loop())
            .map(|i| self.min_tilt_deg + i as f64 * self.increment_deg)
            .collect()
    }
}

/// Phase of the sequencer. Terminal results live in [`RunOutcome`];
/// the control state always returns to `Idle` when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Homing,
    Sweeping,
    Paused,
    Stopping,
}

/// The single source of truth for "is a run active and which one".
///
/// All transitions are whole read-modify-writes behind one lock, replacing
/// the ad-hoc running/paused flag pair: there is no partially-updated state
/// for a racing run loop to observe. The run id increments on every start
/// (and on emergency stop), so a stale loop notices it has been superseded
/// and exits silently.
#[derive(Debug)]
pub struct RunControl {
    run_id: u64,
    state: RunState,
}

impl RunControl {
    pub fn new() -> Self {
        Self { run_id: 0, state: RunState::Idle }
    }

    pub fn snapshot(&self) -> (u64, RunState) {
        (self.run_id, self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state != RunState::Idle
    }

    /// Idle -> Homing; allocates the new run's id.
    pub fn begin(&mut self) -> Option<u64> {
        if self.is_active() {
            return None;
        }
        self.run_id += 1;
        self.state = RunState::Homing;
        Some(self.run_id)
    }

    /// Homing -> Sweeping, only for the run that started it.
    pub fn enter_sweep(&mut self, run_id: u64) -> bool {
        if self.run_id == run_id && self.state == RunState::Homing {
            self.state = RunState::Sweeping;
            return true;
        }
        false
    }

    pub fn pause(&mut self) -> bool {
        if self.state == RunState::Sweeping {
            self.state = RunState::Paused;
            return true;
        }
        false
    }

    pub fn resume(&mut self) -> bool {
        if self.state == RunState::Paused {
            self.state = RunState::Sweeping;
            return true;
        }
        false
    }

    /// Cooperative stop request; the run loop honors it at its next
    /// checkpoint. Returns false when nothing was running.
    pub fn request_stop(&mut self) -> bool {
        match self.state {
            RunState::Homing | RunState::Sweeping | RunState::Paused => {
                self.state = RunState::Stopping;
                true
            }
            RunState::Idle | RunState::Stopping => false,
        }
    }

    /// Emergency path: clears the current and any future run's claim to the
    /// id, so an in-flight loop exits silently at its next identity check.
    pub fn force_idle(&mut self) {
        self.run_id += 1;
        self.state = RunState::Idle;
    }

    /// Terminal cleanup by the run loop itself; a stale loop (superseded id)
    /// must not release state it no longer owns.
    pub fn finish(&mut self, run_id: u64) -> bool {
        if self.run_id == run_id {
            self.state = RunState::Idle;
            return true;
        }
        false
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded point. Append-only; written to the sink as produced.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub timestamp: DateTime<Local>,
    pub target_deg: f64,
    pub measured_deg: f64,
    pub temperature_c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Stopped,
}

/// End-of-run report delivered on the event channel.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: u64,
    pub outcome: RunOutcome,
    pub points_recorded: u32,
    pub total_points: u32,
    pub completion_percentage: u8,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    InvalidParameters(#[from] InvalidParameters),
    #[error("a test run is already active")]
    AlreadyRunning,
    #[error("hardware is not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TestParameters {
        TestParameters::default()
    }

    #[test]
    fn test_default_parameters_validate() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_each_bound_rejects() {
        let cases: Vec<(fn(&mut TestParameters), &str)> = vec![
            (|p| p.min_tilt_deg = -30.5, "minimum tilt"),
            (|p| p.max_tilt_deg = 31.0, "maximum tilt"),
            (|p| p.min_tilt_deg = p.max_tilt_deg, "less than"),
            (|p| p.increment_deg = 0.05, "increment"),
            (|p| p.increment_deg = 3.5, "increment"),
            (|p| p.dwell_secs = 4.0, "dwell"),
            (|p| p.dwell_secs = 61.0, "dwell"),
            (|p| p.loops = 0, "loops"),
        ];
        for (mutate, needle) in cases {
            let mut p = params();
            mutate(&mut p);
            let err = p.validate().unwrap_err();
            assert!(
                err.reason.contains(needle),
                "expected {:?} to mention {:?}",
                err.reason,
                needle
            );
        }
    }

    #[test]
    fn test_points_per_loop_counts_endpoints() {
        let mut p = params();
        p.min_tilt_deg = -2.0;
        p.max_tilt_deg = 2.0;
        p.increment_deg = 1.0;
        assert_eq!(p.points_per_loop(), 5);
        assert_eq!(p.angles(), vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_run_control_transitions() {
        let mut control = RunControl::new();
        assert!(!control.is_active());

        let id = control.begin().unwrap();
        assert_eq!(control.snapshot(), (id, RunState::Homing));
        assert!(control.begin().is_none());

        assert!(control.enter_sweep(id));
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());

        assert!(control.request_stop());
        // Second stop is a no-op; the run loop only cleans up once.
        assert!(!control.request_stop());

        assert!(control.finish(id));
        assert!(!control.is_active());
    }

    #[test]
    fn test_force_idle_supersedes_run_id() {
        let mut control = RunControl::new();
        let id = control.begin().unwrap();
        control.force_idle();
        assert!(!control.is_active());
        // The displaced loop may not release state it no longer owns.
        assert!(!control.finish(id));
        let next = control.begin().unwrap();
        assert!(next > id);
    }

    #[test]
    fn test_enter_sweep_requires_matching_id() {
        let mut control = RunControl::new();
        let id = control.begin().unwrap();
        assert!(!control.enter_sweep(id + 1));
        assert!(control.enter_sweep(id));
    }
}
