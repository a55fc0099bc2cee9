//! Syscall sandbox for forked children.
//!
//! A supervising process forks a child, the child stops itself, and the parent attaches a kernel
//! control channel to it and installs a static syscall allow-list before letting it continue.
//! See [sandbox] for the protocol and [policy] for the allow-list.

#[cfg(not(any(target_os = "linux", target_os = "openbsd")))]
compile_error!("ksandbox only supports Linux and OpenBSD");

pub mod device;
pub mod policy;
pub mod sandbox;
pub mod sysno;
pub mod systrace;

#[cfg(test)]
mod testing;

pub use device::{Channel, Device, PolicyId};
pub use policy::{Policy, Rule, Verdict, PREAUTH};
pub use sandbox::{spawn, Sandbox, SandboxError};
pub use systrace::Systrace;
