//! Dispatch — turns scheduled send intents into delivery attempts: the
//! polling worker with its single-flight lease, tracking records, retry
//! policy, engagement ingestion, and the stalled-job reconciler.

pub mod engagement;
pub mod recovery;
pub mod render;
pub mod retry;
pub mod sender;
pub mod store;
pub mod worker;

pub use engagement::{EngagementEvent, EngagementIngest};
pub use recovery::Reconciler;
pub use render::{PassthroughRenderer, TemplateRenderer};
pub use retry::RetryPolicy;
pub use sender::{BlackholeSender, EmailSender, SendError, SendReceipt, SendRequest};
pub use store::{MemoryStore, OutreachStore};
pub use worker::DispatchWorker;
