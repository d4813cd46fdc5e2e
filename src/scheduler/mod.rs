pub mod balancer;
pub mod dispatcher;
pub mod info_provider;
pub mod keyspan_set;
pub mod watermark;

pub use balancer::{BalancePolicy, KeySpanMove, LeastLoaded};
pub use dispatcher::{CaptureSnapshot, ScheduleDispatcher, SchedulerSnapshot};
pub use info_provider::{InfoProvider, TaskPosition, TaskStatus};
pub use keyspan_set::{ConfirmOutcome, KeySpanRecord, KeySpanSet, KeySpanStatus};
pub use watermark::{CaptureStatus, SyncStatus, Watermark};
