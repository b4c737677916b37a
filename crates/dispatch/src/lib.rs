//! Session-bounded dispatch of inbound envelopes.
//!
//! Transports call [`Dispatcher::submit`]; the envelope is queued in its
//! session's slot, and a single background loop admits queued envelopes into
//! a fixed-size worker pool while the session has spare capacity. Every
//! admitted run carries a cancellation token that `cancel_session`,
//! `cancel_all` and `shutdown` trip.

pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod priority;
pub mod session;

pub use {
    dispatcher::{Dispatcher, DispatcherState, DispatcherStats, EnvelopeProcessor},
    error::{Error, Result},
    pool::{WorkerPermit, WorkerPool},
    priority::{PrefixPriority, PriorityRule},
    session::{Admission, CancelReport, ExecutionHandle, SessionTable, TableStats},
};
