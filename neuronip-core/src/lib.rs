pub mod clock;
pub mod context;
pub mod pattern;
pub mod task;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use context::{CancelHandle, Context, ContextError};
pub use pattern::{contains_marker, matches_affix};
pub use task::PeriodicTask;
