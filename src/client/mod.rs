//! Client-side companion protocol: the reconciliation poller that heals gaps
//! left by transient channel loss, and the reconnect backoff schedule.

pub mod backoff;
pub mod poller;

pub use backoff::Backoff;
pub use poller::{ConversationView, HttpSource, MessageSource, PollOutcome, ReconciliationPoller};
