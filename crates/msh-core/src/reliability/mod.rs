//! Reliability engines
//!
//! Two independent tracks keep side-effects moving until they complete:
//! reception awareness resends pushed user messages until a receipt or error
//! answers them, and the retry engine re-attempts deliver and notify
//! side-effects with exponential backoff. Both evaluate deadlines from stored
//! timestamps, so a restart never loses a pending retry.

pub mod awareness;
pub mod retry;

pub use awareness::{ReceptionAwarenessEngine, SweepReport};
pub use retry::{
    DeliverCallbacks, NotifyExceptionCallbacks, NotifyMessageCallbacks, RetryCallbacks, RetryDecision,
    RetryEngine, RetrySweepReport, SendCallbacks,
};
