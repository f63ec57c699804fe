//! A containerd shim that hands container processes over to systemd.
//!
//! Every container's init process, and every process exec'd into a container,
//! runs as a service unit whose command is a runc invocation. The
//! shim writes the unit, starts it, and tracks the process through the pid
//! file runc leaves behind and the unit state systemd reports.

pub mod console;
pub mod process;
pub mod runc;
pub mod sandbox;
pub mod systemd;

#[cfg(test)]
mod testing;
