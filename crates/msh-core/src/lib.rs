//! AS4 Message Service Handler Core
//!
//! This crate provides the processing core of an AS4/ebMS3 Message Service
//! Handler: the message model, Processing Modes and their resolution, the
//! step/result pipeline framework, the message ledger contract, duplicate
//! detection, and the reception awareness and retry/backoff engines that keep
//! messages moving until they are acknowledged, delivered or dead-lettered.
//!
//! Wire encoding, cryptography, HTTP transport and persistent storage are
//! consumed through the traits in [`external`] and [`ledger`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod context;
pub mod duplicates;
pub mod errors;
pub mod external;
pub mod ledger;
pub mod message;
pub mod pmode;
pub mod pull;
pub mod reliability;
pub mod send_result;
pub mod step;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{AgentConfig, MshConfig, PModeConfig, PullRequestConfig, ReceiveConfig};
pub use context::{MessagingContext, ReceiveResponse, ReceivedMessage, StepResult};
pub use errors::{
    ErrorKind, ErrorResult, LedgerError, MshError, MshResult, ResolutionError, Result, TransportError,
};
pub use external::{
    Deliverer, DeliverMessage, DynamicDiscovery, EncodedMessage, MessageCodec, Notifier, NotifyMessage,
    SecurityProvider, Transport, TransportOutcome, TransportRequest,
};
pub use ledger::{
    ExceptionRecord, InMemoryBodyStore, InMemoryLedger, Ledger, MessageBodyStore, MessageRecord, Operation,
    ReceptionAwareness, RetryOwner, RetryReliability, RetryType, Status,
};
pub use message::{
    As4Message, ErrorCode, MessageUnit, Party, PullRequest, Receipt, Service, SignalMessage, UserMessage,
};
pub use pmode::{PModeProvider, PModeResolver, ReceivingPMode, SendingPMode};
pub use pull::{PullBundlingService, PullSelection};
pub use reliability::{ReceptionAwarenessEngine, RetryEngine, SweepReport};
pub use send_result::SendResult;
pub use step::{CatchAllStep, CompositeStep, Pipeline, Step, StepOutcome};
pub use types::{
    Direction, ManualTimeSource, Mep, MessageType, ProcessingMode, RecordId, SystemTimeSource, TimeSource,
    Timestamp,
};
