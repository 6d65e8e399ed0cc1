//! Generic pipeline engine: topology, retry policy, publisher and consumer runtime.

pub mod consumer;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod shutdown;
pub mod topology;

pub use consumer::{handler_fn, ConsumerRuntime, FnStage, RunSummary, Stage};
pub use error::{ConsumerError, StageError};
pub use publisher::{PublishError, Publisher};
pub use retry::{FailureOutcome, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use topology::{QueueTopology, Route};
