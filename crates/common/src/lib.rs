//! Ambient support shared between the `protocol` crate and the `vhotplug`
//! daemon binary: the mailbox bridge between blocking and async contexts,
//! the internal error type, logging setup, request-rate limiting and
//! daemon-wide counters.

pub mod channel;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod test_utils;

pub use channel::{MailboxRx, MailboxTx, mailbox};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_limiter::{RequestRateLimit, RequestRateLimiter};
