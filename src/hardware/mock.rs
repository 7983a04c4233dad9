use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{Transport, TransportError};

/// Inspectable state behind a [`MockTransport`]. Tests keep a clone of the
/// handle to assert on writes after the transport has been handed off.
#[derive(Default)]
pub struct MockState {
    pub queue: VecDeque<String>,
    pub writes: Vec<String>,
    pub closed: bool,
}

pub type MockHandle = Arc<Mutex<MockState>>;

type Responder = Box<dyn FnMut(&str, &mut MockState) + Send>;

/// In-memory stand-in for the serial link.
///
/// An optional responder closure plays the firmware: it sees each written
/// command and pushes response lines onto the read queue. Without a
/// responder every read times out, which is exactly how a dead link looks.
pub struct MockTransport {
    state: MockHandle,
    responder: Option<Responder>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let state: MockHandle = Arc::default();
        let transport = Self { state: Arc::clone(&state), responder: None };
        (transport, state)
    }

    pub fn with_responder<F>(responder: F) -> (Self, MockHandle)
    where
        F: FnMut(&str, &mut MockState) + Send + 'static,
    {
        let (mut transport, state) = Self::new();
        transport.responder = Some(Box::new(responder));
        (transport, state)
    }

    /// A scripted firmware image: homes, moves, and answers sensor reads
    /// with plausible values. Used by the `--mock` wiring so the whole
    /// application can run without hardware attached.
    pub fn simulated() -> (Self, MockHandle) {
        let mut position: i64 = 0;
        let mut homed = false;
        Self::with_responder(move |command, state| {
            let mut push = |line: &str| state.queue.push_back(line.to_string());
            match command {
                "HOME" => {
                    position = 0;
                    homed = true;
                    push("Starting homing sequence");
                    push("Home switch triggered");
                    push("Homing complete");
                }
                "STATUS" => {
                    push(&format!(
                        "POS {} ANGLE {:.4} SPEED 400.0 ACCEL 800.0 HOMED {} E_STOP NO",
                        position,
                        position as f64 * super::protocol::DEG_PER_STEP,
                        if homed { "YES" } else { "NO" },
                    ));
                }
                "TEMP" => push("Temperature: 23.40"),
                "TILT" => push(&format!(
                    "Tilt: {:.2}",
                    position as f64 * super::protocol::DEG_PER_STEP
                )),
                "CALIBRATE" => push("CALIBRATED"),
                "STOP" => push("Stopped"),
                "EMERGENCY_STOP" => push("Emergency stop engaged"),
                other => {
                    if let Some(steps) = other.strip_prefix("MOVE ") {
                        if let Ok(steps) = steps.parse::<i64>() {
                            position += steps;
                            push("Moving to target");
                            push("Movement complete");
                        } else {
                            push("ERROR: bad MOVE argument");
                        }
                    } else {
                        push(&format!("ERROR: unknown command {}", other));
                    }
                }
            }
        })
    }
}

impl Transport for MockTransport {
    fn read_line(&mut self, _timeout: Duration) -> Result<String, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.queue.pop_front().ok_or(TransportError::Timeout)
    }

    fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.writes.push(text.to_string());
        if let Some(responder) = self.responder.as_mut() {
            responder(text, &mut state);
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().queue.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}
