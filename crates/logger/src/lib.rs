//! Shared tracing setup for the Uppe binaries.

mod tracing;

pub use self::tracing::{LogFormat, init, init_with_level};
pub use ::tracing::level_filters::LevelFilter;
