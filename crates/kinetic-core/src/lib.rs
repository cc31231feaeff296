pub mod error;
pub mod metric_names;
pub mod time;

pub use crate::error::{CoordError, ErrorCategory, Result, codes};
pub use crate::time::{
    Clock, ManualClock, SharedClock, SystemClock, from_millis, now_utc, to_millis,
};
