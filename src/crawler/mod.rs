pub mod canonical;
pub mod controller;
pub mod error;
pub mod filter;
pub mod gate;
pub mod lock;
pub mod progress;
pub mod request;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use canonical::{CanonicalUrl, Canonicalizer};
pub use controller::{JobCoordinator, JobHandle, JobSnapshot};
pub use error::{CrawlError, FetchError, FetchErrorKind};
pub use filter::{is_eligible, FilterPolicy};
pub use progress::{ProgressEvent, ProgressPublisher, ProgressTracker};
pub use request::{CrawlParams, CrawlRequest};
pub use scheduler::{CrawlReport, JobControl, Scheduler, SchedulerSettings};
pub use task::{CrawlJob, JobStatus, Level, PageResult, RenderedPage};
