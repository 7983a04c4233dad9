pub mod control;
pub mod task;
pub mod types;

pub use control::Sequencer;
pub use types::{
    InvalidParameters, Measurement, RunControl, RunOutcome, RunState, RunSummary, StartError,
    TestKind, TestParameters,
};
