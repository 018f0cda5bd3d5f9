//! Cross-process coordination through atomic key-value operations.

mod config;
pub mod mutex;
pub mod queue;

pub use config::{LockConfig, QueueConfig};
pub use mutex::{AcquireOptions, DistributedMutex, LockOutcome, ReleaseOutcome};
pub use queue::{
    DeliveryOutcome, Delivery, DequeueOptions, FieldRule, PushOutcome, RetryOutcome,
    ReturnPredicate, Routed, TaskResult, WorkQueue,
};
