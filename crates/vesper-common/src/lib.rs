pub mod error;
pub mod types;

pub use error::{Result, VesperError};
pub use types::*;
