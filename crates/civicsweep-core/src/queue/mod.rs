//! Durable, ordered retry queue for mutating actions.

mod backoff;
pub mod item;
pub mod retry;

pub use backoff::{base_delay, retry_delay, MAX_RETRY_COUNT};
pub use item::{
    Assignment, BlockedItem, NewReport, PayloadError, QueueAction, QueueItem, QueueKind, QueueStatus,
    ReportStatus, StatusChange, VendorCompletion,
};
pub use retry::{FlushOutcome, QueueError, RetryQueue};
