//! The task service containerd talks to, and what it keeps track of.

mod local;

pub mod events;
pub mod mount;
pub mod registry;
pub mod task;

pub use local::Local;
