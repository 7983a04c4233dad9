/**
 * Connection lifecycle for the hardware link.
 *
 * Owns discovery (Arduino Due native port first, programming port second,
 * any ACM device last), connect/disconnect, a 10 s liveness poll with a
 * single reconnect attempt, and the drain task that republishes unsolicited
 * firmware chatter as log lines.
 */

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Dispatcher, SendOptions};
use super::protocol::{classify_line, Command, LineClass};
use super::transport::{SerialTransport, SharedTransport, Transport, TransportError};
use crate::events::{emit, AppEvent, EventSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("no suitable serial port found")]
    NoPortFound,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Probe candidate device paths in priority order, returning the first that
/// actually opens. Returns `None` when nothing usable is attached.
pub fn discover_port(baudrate: u32, timeout: Duration) -> Option<String> {
    let ports = serialport::available_ports().ok()?;

    let mut candidates: Vec<String> = Vec::new();
    for pattern in ["Native", "Programming"] {
        for info in &ports {
            if let serialport::SerialPortType::UsbPort(usb) = &info.port_type {
                let product = usb.product.as_deref().unwrap_or("");
                if product.contains("Arduino Due") && product.contains(pattern) {
                    candidates.push(info.port_name.clone());
                }
            }
        }
    }
    for info in &ports {
        if info.port_name.contains("ttyACM") && !candidates.contains(&info.port_name) {
            candidates.push(info.port_name.clone());
        }
    }

    for candidate in candidates {
        match SerialTransport::open(&candidate, baudrate, timeout) {
            Ok(_) => {
                debug!("discovery: {} opens", candidate);
                return Some(candidate);
            }
            Err(e) => debug!("discovery: {} rejected: {}", candidate, e),
        }
    }
    None
}

pub struct ConnectionManager {
    transport: SharedTransport,
    state: Arc<RwLock<ConnectionState>>,
    events: EventSender,
    baudrate: u32,
    timeout: Duration,
    /// Last successfully opened port, reused by reconnect attempts.
    last_port: Mutex<Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        transport: SharedTransport,
        events: EventSender,
        baudrate: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
            baudrate,
            timeout,
            last_port: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.write().unwrap();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            emit(&self.events, AppEvent::Connection(state));
        }
    }

    /// Open the hardware link, discovering a port when none is given.
    pub fn connect(&self, port: Option<&str>) -> Result<(), ConnError> {
        self.set_state(ConnectionState::Connecting);

        let port = match port {
            Some(p) => p.to_string(),
            None => match discover_port(self.baudrate, self.timeout) {
                Some(p) => p,
                None => {
                    error!("no available hardware ports found");
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnError::NoPortFound);
                }
            },
        };

        info!("connecting to {} at {} baud", port, self.baudrate);
        let mut transport = match SerialTransport::open(&port, self.baudrate, self.timeout) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to connect: {}", e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        // The board resets on open and prints a boot banner; drop it so the
        // first command does not race stale lines.
        if let Err(e) = transport.clear_input() {
            warn!("could not clear stale input: {}", e);
        }

        *self.transport.lock().unwrap() = Some(Box::new(transport));
        *self.last_port.lock().unwrap() = Some(port.clone());
        self.set_state(ConnectionState::Connected);
        info!("connected to {}", port);
        Ok(())
    }

    /// Install an already-open transport (mock wiring, tests).
    pub fn attach(&self, transport: Box<dyn Transport>) {
        *self.transport.lock().unwrap() = Some(transport);
        self.set_state(ConnectionState::Connected);
    }

    /// Idempotent; safe from cleanup paths.
    pub fn disconnect(&self) {
        if let Some(mut transport) = self.transport.lock().unwrap().take() {
            transport.close();
            info!("disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// One liveness probe: a status request outside the run gate. On failure
    /// the link goes Faulted and a single reconnect is attempted; if that
    /// also fails the state stays Faulted and new runs are refused.
    pub async fn poll(&self, dispatcher: &Dispatcher) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let probe = SendOptions {
            retry_count: 0,
            ..SendOptions::for_command(&Command::Status)
        };
        if dispatcher.send_unchecked(Command::Status, probe).await.is_ok() {
            return;
        }

        warn!("liveness check failed; attempting reconnect");
        self.set_state(ConnectionState::Faulted);
        if let Some(mut dead) = self.transport.lock().unwrap().take() {
            dead.close();
        }

        let port = self.last_port.lock().unwrap().clone();
        match self.connect(port.as_deref()) {
            Ok(()) => info!("reconnected after fault"),
            Err(e) => {
                error!("reconnect failed: {}", e);
                self.set_state(ConnectionState::Faulted);
            }
        }
    }

    /// Periodic liveness poll, every `interval`.
    pub fn spawn_poll(self: &Arc<Self>, dispatcher: Arc<Dispatcher>, interval: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                manager.poll(&dispatcher).await;
            }
        });
    }
}

/// Drain unsolicited lines (boot banners, asynchronous progress chatter)
/// whenever the dispatcher is not holding the transport, and republish them
/// as severity-tagged log lines. Never contends with an in-flight command:
/// it only takes the lock opportunistically.
pub fn spawn_drain(transport: SharedTransport) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let transport = Arc::clone(&transport);
            let _ = task::spawn_blocking(move || {
                let Ok(mut guard) = transport.try_lock() else {
                    return;
                };
                let Some(port) = guard.as_mut() else {
                    return;
                };
                while let Ok(line) = port.read_line(Duration::from_millis(20)) {
                    if line.is_empty() {
                        continue;
                    }
                    match classify_line(&line) {
                        LineClass::Error => error!(target: "hardware", "{}", line),
                        LineClass::Other => debug!(target: "hardware", "{}", line),
                        _ => info!(target: "hardware", "{}", line),
                    }
                }
            })
            .await;
        }
    });
}
