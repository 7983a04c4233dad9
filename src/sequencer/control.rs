use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, info, warn};

use super::task::{run_loop, RunContext};
use super::types::{RunControl, RunState, StartError, TestParameters};
use crate::data::SharedSink;
use crate::events::{emit, AppEvent, EventSender};
use crate::hardware::dispatcher::SendOptions;
use crate::hardware::{Command, ConnectionState, Dispatcher};
use crate::vna::SweepTrigger;

/// Operator-facing handle over the run state machine. Command methods only
/// flip control state or spawn the worker; they never block on hardware.
pub struct Sequencer {
    control: Arc<Mutex<RunControl>>,
    dispatcher: Arc<Dispatcher>,
    trigger: Arc<dyn SweepTrigger>,
    sink: SharedSink,
    events: EventSender,
    connection: Arc<RwLock<ConnectionState>>,
}

impl Sequencer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        trigger: Arc<dyn SweepTrigger>,
        sink: SharedSink,
        events: EventSender,
        connection: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        Self {
            control: dispatcher.control(),
            dispatcher,
            trigger,
            sink,
            events,
            connection,
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().unwrap().is_active()
    }

    /// Validate parameters and launch the run loop. Returns as soon as the
    /// worker is spawned; progress arrives on the event channel. Rejections
    /// happen before any hardware I/O.
    pub fn start(&self, params: &TestParameters) -> Result<(), StartError> {
        params.validate()?;
        if *self.connection.read().unwrap() != ConnectionState::Connected {
            return Err(StartError::NotConnected);
        }

        // The copy is taken under the control lock, so concurrent parameter
        // edits cannot leak into a run that has already been claimed.
        let (run_id, params) = {
            let mut control = self.control.lock().unwrap();
            let run_id = control.begin().ok_or(StartError::AlreadyRunning)?;
            (run_id, params.clone())
        };
        emit(&self.events, AppEvent::RunState(RunState::Homing));
        info!("test run {} starting: {:?} sweep", run_id, params.kind);

        let ctx = RunContext {
            run_id,
            params,
            control: Arc::clone(&self.control),
            dispatcher: Arc::clone(&self.dispatcher),
            trigger: Arc::clone(&self.trigger),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
        };
        tokio::spawn(run_loop(ctx));
        Ok(())
    }

    pub fn pause(&self) -> bool {
        let paused = self.control.lock().unwrap().pause();
        if paused {
            emit(&self.events, AppEvent::RunState(RunState::Paused));
            info!("test run paused");
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self.control.lock().unwrap().resume();
        if resumed {
            emit(&self.events, AppEvent::RunState(RunState::Sweeping));
            info!("test run resumed");
        }
        resumed
    }

    /// Cooperative stop: the run loop finishes any in-flight move, then
    /// breaks out and returns the platform to zero. Repeat calls are no-ops.
    pub fn stop(&self) -> bool {
        let stopping = self.control.lock().unwrap().request_stop();
        if stopping {
            emit(&self.events, AppEvent::RunState(RunState::Stopping));
            info!("stop requested");
        }
        stopping
    }

    /// Highest-priority halt. Force-clears the run state first (any live
    /// loop exits silently at its next identity check), then best-effort
    /// commands the hardware to stop. Idempotent; never propagates its own
    /// failures — the return value reports whether the halt request reached
    /// the firmware.
    pub async fn emergency_stop(&self) -> bool {
        warn!("EMERGENCY STOP");
        self.control.lock().unwrap().force_idle();
        emit(&self.events, AppEvent::RunState(RunState::Idle));

        let mut delivered = true;
        if let Err(e) = self
            .dispatcher
            .send_unchecked(Command::EmergencyStop, SendOptions::best_effort())
            .await
        {
            error!("emergency stop command not confirmed: {}", e);
            delivered = false;
        }
        self.dispatcher.reset_io().await;
        delivered
    }
}
