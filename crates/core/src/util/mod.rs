pub mod arena;
mod time_source;

pub use arena::{Arena, Handle};
pub use time_source::{InstantTimeSrc, TimeSource};

#[cfg(any(test, feature = "testing"))]
pub use time_source::MockTimeSource;
