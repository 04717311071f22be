pub mod bootenv;
pub mod config;
pub mod error;
pub mod io;
pub mod schedule;
pub mod timer;

pub use error::{IgupdError, Result};
