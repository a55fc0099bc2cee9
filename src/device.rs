/// The kernel facility used to restrict another process's syscalls.
///
/// A [Device] hands out private control channels. A [Channel] is attached to exactly one process,
/// carries the policy for it, and closing it (dropping the value) while the process is still
/// attached kills that process.
use anyhow::Result;
use nix::unistd::Pid;

use crate::policy::Verdict;
use crate::sysno::Code;

/// Kernel-assigned handle of a policy context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyId(pub i32);

pub trait Device {
  type Channel: Channel;

  /// Open the control device and clone a private channel from it.
  fn clone_channel(&self) -> Result<Self::Channel>;
}

pub trait Channel {
  /// Start tracing `pid` through this channel.
  fn attach(&mut self, pid: Pid) -> Result<()>;

  /// Allocate a policy context with room for `max_entries` syscalls.
  fn new_policy(&mut self, max_entries: Code) -> Result<PolicyId>;

  /// Make `policy` the active policy of `pid`.
  fn assign_policy(&mut self, policy: PolicyId, pid: Pid) -> Result<()>;

  /// Set the verdict for a single syscall of `policy`.
  fn set_verdict(&mut self, policy: PolicyId, code: Code, verdict: Verdict) -> Result<()>;
}
