/**
 * Command dispatcher: one request/response cycle at a time.
 *
 * The protocol has no request ids; responses correlate to commands only by
 * strict ordering. The transport mutex is therefore held for one whole
 * attempt (write plus every read of that attempt), and the run loop, the
 * liveness poll and the operator surface all funnel through here.
 *
 * Each command kind has its own conversational shape: HOME and MOVE stream
 * progress lines before a terminal ack, the rest answer in one line.
 */

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task;
use tracing::{debug, warn};

use super::protocol::{
    classify_line, latest_complete_frame, parse_status, Command, LineClass, ParseError,
    StatusRecord,
};
use super::transport::{SharedTransport, Transport, TransportError};
use crate::sequencer::RunControl;

pub const DEFAULT_RETRY_COUNT: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Window for single-line responses (STATUS, TEMP, TILT, acks).
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Motion commands keep the line busy until the mechanics finish.
pub const MOVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const HOME_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub response_timeout: Duration,
}

impl SendOptions {
    pub fn for_command(command: &Command) -> Self {
        let response_timeout = match command {
            Command::Home => HOME_TIMEOUT,
            Command::Move(_) => MOVE_TIMEOUT,
            _ => DEFAULT_RESPONSE_TIMEOUT,
        };
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            response_timeout,
        }
    }

    /// Single attempt, short window. Used by best-effort paths (emergency
    /// stop, return-to-zero cleanup) that must not stall on retries.
    pub fn best_effort() -> Self {
        Self {
            retry_count: 0,
            retry_delay: Duration::ZERO,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Status(StatusRecord),
    Text(String),
}

impl Response {
    pub fn into_text(self) -> String {
        match self {
            Response::Status(record) => format!("{:?}", record),
            Response::Text(line) => line,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command failed after {attempts} attempt(s): {last_error}")]
    CommandFailed { attempts: u32, last_error: String },
    #[error("no test run is active")]
    TestNotRunning,
    #[error("not connected")]
    NotConnected,
}

/// Why one attempt ended without a usable response. Timeouts, transport
/// faults and parse failures all consume a retry; an explicit firmware
/// ERROR aborts the retry loop outright.
#[derive(Debug)]
enum AttemptError {
    Timeout,
    Transport(TransportError),
    Parse(ParseError),
    Firmware(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Timeout => write!(f, "no response before timeout"),
            AttemptError::Transport(e) => write!(f, "{}", e),
            AttemptError::Parse(e) => write!(f, "{}", e),
            AttemptError::Firmware(line) => write!(f, "{}", line),
        }
    }
}

pub struct Dispatcher {
    transport: SharedTransport,
    control: Arc<Mutex<RunControl>>,
}

impl Dispatcher {
    pub fn new(transport: SharedTransport, control: Arc<Mutex<RunControl>>) -> Self {
        Self { transport, control }
    }

    pub fn control(&self) -> Arc<Mutex<RunControl>> {
        Arc::clone(&self.control)
    }

    /// Operator-facing send. Non-lifecycle commands are rejected locally
    /// while no test run is active; STOP and EMERGENCY_STOP always pass.
    pub async fn send(&self, command: Command) -> Result<Response, DispatchError> {
        self.send_with(command, SendOptions::for_command(&command)).await
    }

    pub async fn send_with(
        &self,
        command: Command,
        options: SendOptions,
    ) -> Result<Response, DispatchError> {
        if !command.is_lifecycle() && !self.control.lock().unwrap().is_active() {
            return Err(DispatchError::TestNotRunning);
        }
        self.send_unchecked(command, options).await
    }

    /// Ungated path for internal callers: the run loop (which owns the
    /// active run), the connection liveness probe, and best-effort cleanup.
    pub(crate) async fn send_unchecked(
        &self,
        command: Command,
        options: SendOptions,
    ) -> Result<Response, DispatchError> {
        let attempts = 1 + options.retry_count;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let transport = Arc::clone(&self.transport);
            let timeout = options.response_timeout;
            let outcome = task::spawn_blocking(move || {
                let mut guard = transport.lock().unwrap();
                match guard.as_mut() {
                    Some(port) => run_attempt(port.as_mut(), command, timeout),
                    None => Err(AttemptError::Transport(TransportError::Closed)),
                }
            })
            .await
            .map_err(|e| DispatchError::CommandFailed {
                attempts: attempt,
                last_error: format!("worker panicked: {}", e),
            })?;

            match outcome {
                Ok(response) => return Ok(response),
                Err(AttemptError::Transport(TransportError::Closed)) => {
                    return Err(DispatchError::NotConnected);
                }
                Err(AttemptError::Firmware(line)) => {
                    return Err(DispatchError::CommandFailed { attempts: attempt, last_error: line });
                }
                Err(e) => {
                    last_error = e.to_string();
                    debug!("{} attempt {}/{} failed: {}", command.verb(), attempt, attempts, last_error);
                    if attempt < attempts {
                        tokio::time::sleep(options.retry_delay).await;
                    }
                }
            }
        }

        Err(DispatchError::CommandFailed { attempts, last_error })
    }

    /// Best-effort transport reset used by the emergency path: drop any
    /// buffered input so the next command starts clean. Failures are logged
    /// and swallowed.
    pub(crate) async fn reset_io(&self) {
        let transport = Arc::clone(&self.transport);
        let _ = task::spawn_blocking(move || {
            if let Some(port) = transport.lock().unwrap().as_mut() {
                if let Err(e) = port.clear_input() {
                    warn!("transport reset failed: {}", e);
                }
            }
        })
        .await;
    }
}

/// One full attempt against the wire: clear stale input, write the command,
/// read lines until this command's terminal shape or the deadline.
fn run_attempt(
    port: &mut dyn Transport,
    command: Command,
    timeout: Duration,
) -> Result<Response, AttemptError> {
    port.clear_input().map_err(AttemptError::Transport)?;
    port.write_line(&command.encode()).map_err(AttemptError::Transport)?;
    debug!("sent {}", command.encode());

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if !d.is_zero() => d,
            _ => return Err(AttemptError::Timeout),
        };
        let line = match port.read_line(remaining) {
            Ok(line) if line.is_empty() => continue,
            Ok(line) => line,
            Err(TransportError::Timeout) => continue,
            Err(e) => return Err(AttemptError::Transport(e)),
        };
        debug!("recv {}", line);

        match command {
            Command::Home => {
                // "Starting homing sequence" and switch-trigger progress
                // lines are expected chatter, not failures.
                if line.contains("Homing complete") {
                    return Ok(Response::Text(line));
                }
                if line.contains("ERROR") {
                    return Err(AttemptError::Firmware(line));
                }
            }
            Command::Move(_) => {
                if line.contains("Movement complete") {
                    return Ok(Response::Text(line));
                }
                if line.contains("ERROR") {
                    // The tilt sensor occasionally drops off the I2C bus
                    // mid-move; the motion itself still finishes.
                    if line.contains("MPU6050") {
                        warn!("sensor glitch during move: {}", line);
                        continue;
                    }
                    return Err(AttemptError::Firmware(line));
                }
                if classify_line(&line) == LineClass::Motion {
                    debug!("{}", line);
                }
            }
            Command::Status => {
                if line.contains("ERROR") {
                    return Err(AttemptError::Firmware(line));
                }
                if line.contains("POS") {
                    let frame = latest_complete_frame(&line).map_err(AttemptError::Parse)?;
                    let record = parse_status(&frame).map_err(AttemptError::Parse)?;
                    return Ok(Response::Status(record));
                }
            }
            Command::Temp
            | Command::Tilt
            | Command::Calibrate
            | Command::EmergencyStop
            | Command::Stop => {
                if line.contains("ERROR") {
                    return Err(AttemptError::Firmware(line));
                }
                // First line read is authoritative.
                return Ok(Response::Text(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;
    use crate::hardware::transport::shared_transport;

    fn fast_options() -> SendOptions {
        SendOptions {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_millis(5),
            response_timeout: Duration::from_millis(50),
        }
    }

    fn active_control() -> Arc<Mutex<RunControl>> {
        let control = Arc::new(Mutex::new(RunControl::new()));
        control.lock().unwrap().begin().unwrap();
        control
    }

    fn dispatcher_with(
        transport: MockTransport,
        control: Arc<Mutex<RunControl>>,
    ) -> Dispatcher {
        let shared = shared_transport();
        *shared.lock().unwrap() = Some(Box::new(transport));
        Dispatcher::new(shared, control)
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (transport, _) = MockTransport::with_responder(|cmd, state| {
            if cmd == "STATUS" {
                state.queue.push_back(
                    "POS 10 ANGLE 0.5 SPEED 400.0 ACCEL 800.0 HOMED YES E_STOP NO".into(),
                );
            }
        });
        let dispatcher = dispatcher_with(transport, active_control());
        match dispatcher.send_with(Command::Status, fast_options()).await.unwrap() {
            Response::Status(record) => {
                assert_eq!(record.position, 10);
                assert!(record.homed);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_count_bounds_attempts() {
        // A transport that never answers: 1 initial + 2 retries = 3 writes.
        let (transport, handle) = MockTransport::new();
        let dispatcher = dispatcher_with(transport, active_control());
        let err = dispatcher
            .send_with(Command::Temp, fast_options())
            .await
            .unwrap_err();
        match err {
            DispatchError::CommandFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(handle.lock().unwrap().writes.len(), 3);
    }

    #[tokio::test]
    async fn test_firmware_error_fails_without_retry() {
        let (transport, handle) = MockTransport::with_responder(|_, state| {
            state.queue.push_back("ERROR: limit switch open".into());
        });
        let dispatcher = dispatcher_with(transport, active_control());
        let err = dispatcher
            .send_with(Command::Home, fast_options())
            .await
            .unwrap_err();
        match err {
            DispatchError::CommandFailed { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("limit switch"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(handle.lock().unwrap().writes.len(), 1);
    }

    #[tokio::test]
    async fn test_home_tolerates_progress_lines() {
        let (transport, _) = MockTransport::with_responder(|cmd, state| {
            if cmd == "HOME" {
                state.queue.push_back("Starting homing sequence".into());
                state.queue.push_back("Home switch triggered".into());
                state.queue.push_back("Homing complete".into());
            }
        });
        let dispatcher = dispatcher_with(transport, active_control());
        let response = dispatcher.send_with(Command::Home, fast_options()).await.unwrap();
        assert!(response.into_text().contains("Homing complete"));
    }

    #[tokio::test]
    async fn test_move_treats_mpu6050_error_as_warning() {
        let (transport, _) = MockTransport::with_responder(|cmd, state| {
            if cmd.starts_with("MOVE") {
                state.queue.push_back("Moving to target".into());
                state.queue.push_back("ERROR: MPU6050 read failed".into());
                state.queue.push_back("Movement complete".into());
            }
        });
        let dispatcher = dispatcher_with(transport, active_control());
        let response = dispatcher.send_with(Command::Move(100), fast_options()).await.unwrap();
        assert!(response.into_text().contains("Movement complete"));
    }

    #[tokio::test]
    async fn test_move_other_error_is_fatal() {
        let (transport, _) = MockTransport::with_responder(|cmd, state| {
            if cmd.starts_with("MOVE") {
                state.queue.push_back("ERROR: step driver fault".into());
            }
        });
        let dispatcher = dispatcher_with(transport, active_control());
        let err = dispatcher
            .send_with(Command::Move(100), fast_options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("step driver fault"));
    }

    #[tokio::test]
    async fn test_status_parse_failure_consumes_retries() {
        let (transport, handle) = MockTransport::with_responder(|cmd, state| {
            if cmd == "STATUS" {
                // POS present but frame incomplete: a parse failure, which
                // counts exactly like a missing response.
                state.queue.push_back("POS 10 ANGLE 0.5".into());
            }
        });
        let dispatcher = dispatcher_with(transport, active_control());
        let err = dispatcher
            .send_with(Command::Status, fast_options())
            .await
            .unwrap_err();
        match err {
            DispatchError::CommandFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(handle.lock().unwrap().writes.len(), 3);
    }

    #[tokio::test]
    async fn test_gate_rejects_when_no_run_active() {
        let (transport, handle) = MockTransport::new();
        let control = Arc::new(Mutex::new(RunControl::new()));
        let dispatcher = dispatcher_with(transport, control);

        let err = dispatcher.send(Command::Status).await.unwrap_err();
        assert!(matches!(err, DispatchError::TestNotRunning));
        // Rejected locally: nothing reached the wire.
        assert!(handle.lock().unwrap().writes.is_empty());
    }

    #[tokio::test]
    async fn test_gate_passes_lifecycle_commands() {
        let (transport, _) = MockTransport::with_responder(|_, state| {
            state.queue.push_back("Emergency stop engaged".into());
        });
        let control = Arc::new(Mutex::new(RunControl::new()));
        let dispatcher = dispatcher_with(transport, control);
        let response = dispatcher.send(Command::EmergencyStop).await.unwrap();
        assert!(response.into_text().contains("Emergency stop"));
    }

    #[tokio::test]
    async fn test_disconnected_transport_reports_not_connected() {
        let shared = shared_transport();
        let dispatcher = Dispatcher::new(shared, active_control());
        let err = dispatcher
            .send_with(Command::Temp, fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotConnected));
    }
}
