pub mod cancel;
pub mod config;
pub mod error;
pub mod inference;
pub mod models;

pub use cancel::CancelFlag;
pub use error::{EmberError, Result};
