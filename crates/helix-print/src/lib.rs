//! Print workflow: the operation sequencer and the pre-print
//! preparation orchestrator.
//!
//! The sequencer runs a queue of long-running printer operations,
//! treating host status updates as the source of truth for completion.
//! The preparation layer assembles that queue from user toggles,
//! detected capabilities, and a scan of the sliced file.

pub mod preparation;
pub mod sequencer;

pub use preparation::{PrepOptions, PreparedPrint, PrintPreparation};
pub use sequencer::{
    CommandSink, CompleteCallback, Operation, OperationSequencer, OperationType, ProgressCallback,
    SequencerState,
};
