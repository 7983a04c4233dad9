// Cross-task notifications. One bounded channel carries everything the
// operator surface needs; the sequencer worker is the only producer during a
// run, so delivery order matches emission order.

use crate::hardware::ConnectionState;
use crate::sequencer::{Measurement, RunState, RunSummary};

pub const EVENT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub enum AppEvent {
    Connection(ConnectionState),
    RunState(RunState),
    Progress { percent: u8, point: u32, total: u32 },
    Measurement(Measurement),
    RunFinished(RunSummary),
}

pub type EventSender = tokio::sync::mpsc::Sender<AppEvent>;
pub type EventReceiver = tokio::sync::mpsc::Receiver<AppEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::channel(EVENT_CHANNEL_DEPTH)
}

/// Fire-and-forget emission. A full or closed channel drops the event rather
/// than block the worker; the log line is the fallback record.
pub fn emit(tx: &EventSender, event: AppEvent) {
    if let Err(e) = tx.try_send(event) {
        tracing::debug!("event dropped: {}", e);
    }
}
