/// systrace(4) control device.
///
/// Every channel is a clone of `/dev/systrace`. Closing a cloned descriptor while a process is
/// still attached to it makes the kernel kill that process.
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use libc::c_int;
use nix::unistd::Pid;

use crate::device::{Channel, Device, PolicyId};
use crate::policy::Verdict;
use crate::sysno::Code;
use ffi::{strioc_attach, strioc_clone, strioc_policy, PolicyAssign, PolicyData, SystracePolicy};

const SYSTR_POLICY_NEW: c_int = 1;
const SYSTR_POLICY_ASSIGN: c_int = 2;
const SYSTR_POLICY_MODIFY: c_int = 3;

const SYSTR_POLICY_PERMIT: i16 = 1;
const SYSTR_POLICY_NEVER: i16 = 2;
const SYSTR_POLICY_KILL: i16 = 3;

mod ffi {
  use libc::{c_int, pid_t};

  #[repr(C)]
  #[derive(Clone, Copy)]
  pub struct PolicyAssign {
    pub code: i16,
    pub policy: i16,
  }

  #[repr(C)]
  #[derive(Clone, Copy)]
  pub union PolicyData {
    pub assign: PolicyAssign,
    pub pid: pid_t,
    pub maxents: c_int,
  }

  /// `struct systrace_policy` from `<dev/systrace.h>`.
  #[repr(C)]
  #[derive(Clone, Copy)]
  pub struct SystracePolicy {
    pub op: c_int,
    pub num: c_int,
    pub data: PolicyData,
  }

  impl SystracePolicy {
    pub fn new(op: c_int, num: c_int, data: PolicyData) -> SystracePolicy {
      SystracePolicy { op, num, data }
    }
  }

  // Command numbers from `<dev/systrace.h>`: 102 to 104 are DETACH, ANSWER and IO.
  pub const STRIOCCLONE: u8 = 100;
  pub const STRIOCATTACH: u8 = 101;
  pub const STRIOCPOLICY: u8 = 105;

  nix::ioctl_read!(strioc_clone, b's', STRIOCCLONE, c_int);
  nix::ioctl_write_ptr!(strioc_attach, b's', STRIOCATTACH, pid_t);
  nix::ioctl_readwrite!(strioc_policy, b's', STRIOCPOLICY, SystracePolicy);
}

fn verdict_code(verdict: Verdict) -> i16 {
  match verdict {
    Verdict::Permit => SYSTR_POLICY_PERMIT,
    Verdict::Never => SYSTR_POLICY_NEVER,
    Verdict::Kill => SYSTR_POLICY_KILL,
  }
}

/// The systrace control device.
#[derive(Debug, Clone)]
pub struct Systrace {
  path: PathBuf,
}

impl Default for Systrace {
  fn default() -> Self {
    Systrace::new("/dev/systrace")
  }
}

impl Systrace {
  /// A device rooted at `path` instead of `/dev/systrace`.
  pub fn new(path: impl AsRef<Path>) -> Systrace {
    Systrace {
      path: path.as_ref().to_path_buf(),
    }
  }
}

impl Device for Systrace {
  type Channel = SystraceChannel;

  fn clone_channel(&self) -> Result<SystraceChannel> {
    let dev =
      File::open(&self.path).with_context(|| format!("open: {}", self.path.display()))?;
    let mut fd: c_int = -1;
    unsafe { strioc_clone(dev.as_raw_fd(), &mut fd) }.context("ioctl: STRIOCCLONE")?;
    debug!(fd; "cloned systrace channel");
    // The device itself is closed here, only the clone stays open.
    Ok(SystraceChannel {
      fd: unsafe { OwnedFd::from_raw_fd(fd) },
    })
  }
}

/// A cloned systrace descriptor.
#[derive(Debug)]
pub struct SystraceChannel {
  fd: OwnedFd,
}

impl SystraceChannel {
  fn policy(&self, mut request: SystracePolicy) -> Result<SystracePolicy> {
    unsafe { strioc_policy(self.fd.as_raw_fd(), &mut request) }?;
    Ok(request)
  }
}

impl Channel for SystraceChannel {
  fn attach(&mut self, pid: Pid) -> Result<()> {
    let pid = pid.as_raw();
    unsafe { strioc_attach(self.fd.as_raw_fd(), &pid) }.context("ioctl: STRIOCATTACH")?;
    Ok(())
  }

  fn new_policy(&mut self, max_entries: Code) -> Result<PolicyId> {
    let request = SystracePolicy::new(
      SYSTR_POLICY_NEW,
      0,
      PolicyData {
        maxents: max_entries as c_int,
      },
    );
    let reply = self
      .policy(request)
      .context("ioctl: STRIOCPOLICY (new)")?;
    Ok(PolicyId(reply.num))
  }

  fn assign_policy(&mut self, policy: PolicyId, pid: Pid) -> Result<()> {
    let request = SystracePolicy::new(
      SYSTR_POLICY_ASSIGN,
      policy.0,
      PolicyData { pid: pid.as_raw() },
    );
    self
      .policy(request)
      .context("ioctl: STRIOCPOLICY (assign)")?;
    Ok(())
  }

  fn set_verdict(&mut self, policy: PolicyId, code: Code, verdict: Verdict) -> Result<()> {
    let request = SystracePolicy::new(
      SYSTR_POLICY_MODIFY,
      policy.0,
      PolicyData {
        assign: PolicyAssign {
          code: code as i16,
          policy: verdict_code(verdict),
        },
      },
    );
    self
      .policy(request)
      .with_context(|| format!("ioctl: STRIOCPOLICY (modify {code})"))?;
    Ok(())
  }
}
