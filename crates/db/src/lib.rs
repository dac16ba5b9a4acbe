pub mod errors;
pub mod models;
pub mod pg;
pub mod stores;

pub use errors::{DbError, Result};
pub use models::*;
pub use stores::*;
