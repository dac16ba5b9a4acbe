pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;

pub use crate::clock::{Clock, SystemClock};
pub use crate::config::AppConfig;
pub use crate::errors::{CoreError, Result};
