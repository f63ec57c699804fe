//! The shim side: the task service and the pieces it is built from.

pub mod config;
pub mod context;
pub mod error;
pub mod options;
pub mod shim;
pub mod sync;
pub mod utils;

pub use config::Config;
pub use context::Context;
pub use error::{Code, Error, Result};
