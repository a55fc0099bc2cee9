/// Stop/continue handshake and syscall policy installation.
///
/// The supervising process creates a [Sandbox] and forks. The child calls
/// [Sandbox::child_setup], which stops it. The parent calls [Sandbox::parent_setup], which waits
/// for the stop, attaches a control channel, installs the policy and resumes the child. The child
/// never runs a single instruction of its workload before installation is over.
///
/// Note that it is important for this whole library to consistently use [libc::_exit]
/// instead of [std::process::exit], because the latter runs atexit handlers in a forked process.
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use backoff::backoff::Zero;
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use crate::device::{Channel, Device};
use crate::policy::{Policy, PREAUTH};
use crate::sysno;

#[derive(Debug)]
pub enum SandboxError {
  /// A signal primitive failed.
  SignalFailure { op: &'static str, errno: Errno },
  /// Waiting for the child failed outright.
  WaitFailed(Errno),
  /// The child exited, was killed or otherwise did not stop.
  WaitAnomaly(WaitStatus),
  /// Opening the device, attaching or installing the policy failed. The child has been resumed
  /// anyway and should not be trusted.
  SetupFailed(anyhow::Error),
  /// The control channel was never opened.
  AlreadyTornDown,
  /// The child could not be forked.
  Fork(Errno),
}

impl fmt::Display for SandboxError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SandboxError::SignalFailure { op, errno } => write!(f, "{op}: {errno}"),
      SandboxError::WaitFailed(errno) => write!(f, "waitpid: {errno}"),
      SandboxError::WaitAnomaly(WaitStatus::Exited(_, code)) => write!(f, "child exit {code}"),
      SandboxError::WaitAnomaly(WaitStatus::Signaled(_, signal, _)) => {
        write!(f, "child signal {signal}")
      }
      SandboxError::WaitAnomaly(status) => write!(f, "child not stopped: {status:?}"),
      SandboxError::SetupFailed(err) => write!(f, "sandbox setup failed: {err:#}"),
      SandboxError::AlreadyTornDown => write!(f, "control channel not opened"),
      SandboxError::Fork(errno) => write!(f, "fork: {errno}"),
    }
  }
}

impl std::error::Error for SandboxError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      SandboxError::SetupFailed(err) => Some(&**err),
      SandboxError::SignalFailure { errno, .. }
      | SandboxError::WaitFailed(errno)
      | SandboxError::Fork(errno) => Some(errno),
      _ => None,
    }
  }
}

/// Log and terminate the current process.
fn fatal(err: SandboxError) -> ! {
  error!("{err}");
  unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Run `op` until it stops failing with `EINTR`.
fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
  backoff::retry(Zero {}, || match op() {
    Err(Errno::EINTR) => Err(backoff::Error::transient(Errno::EINTR)),
    res => res.map_err(backoff::Error::permanent),
  })
  .map_err(|err| match err {
    backoff::Error::Permanent(err) | backoff::Error::Transient { err, .. } => err,
  })
}

/// Per-child sandbox state.
pub struct Sandbox<D: Device> {
  device: D,
  policy: Policy,
  channel: Option<D::Channel>,
  child: Option<Pid>,
  saved_sigchld: SigAction,
  sigchld_restored: bool,
}

impl<D: Device> Sandbox<D> {
  /// Create a sandbox that will install [PREAUTH].
  ///
  /// `SIGCHLD` is ignored until setup is over, so that the caller's reaping logic cannot race
  /// with the wait in [Sandbox::parent_setup].
  pub fn new(device: D) -> Result<Sandbox<D>, SandboxError> {
    Sandbox::with_policy(device, PREAUTH)
  }

  /// Create a sandbox that will install `policy` instead of [PREAUTH].
  pub fn with_policy(device: D, policy: Policy) -> Result<Sandbox<D>, SandboxError> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let saved_sigchld =
      unsafe { sigaction(Signal::SIGCHLD, &ignore) }.map_err(|errno| SandboxError::SignalFailure {
        op: "sigaction: SIGCHLD",
        errno,
      })?;
    Ok(Sandbox {
      device,
      policy,
      channel: None,
      child: None,
      saved_sigchld,
      sigchld_restored: false,
    })
  }

  /// The sandboxed child, once a channel has been attached to it.
  pub fn child(&self) -> Option<Pid> {
    self.child
  }

  /// Whether a control channel is open and attached to the child.
  pub fn is_attached(&self) -> bool {
    self.channel.is_some()
  }

  fn restore_sigchld(&mut self) -> Result<(), SandboxError> {
    unsafe { sigaction(Signal::SIGCHLD, &self.saved_sigchld) }.map_err(|errno| {
      SandboxError::SignalFailure {
        op: "sigaction: SIGCHLD",
        errno,
      }
    })?;
    self.sigchld_restored = true;
    Ok(())
  }

  /// Child half of the handshake: stop until the parent has installed the policy.
  ///
  /// If the child cannot stop itself it exits immediately, since carrying on would mean running
  /// unrestricted. A failure to restore `SIGCHLD` does not prevent the stop: it is returned only
  /// once the parent has resumed the child.
  pub fn child_setup(&mut self) -> Result<(), SandboxError> {
    let restored = self.restore_sigchld();
    if let Err(errno) = kill(getpid(), Signal::SIGSTOP) {
      fatal(SandboxError::SignalFailure {
        op: "kill: SIGSTOP",
        errno,
      });
    }
    restored
  }

  /// Parent half of the handshake.
  ///
  /// The child is resumed whether or not installation succeeded. On failure the caller should
  /// treat the child as unconfined and get rid of it, normally via [Sandbox::release]. If the
  /// child cannot be observed in its stopped state, this terminates the calling process.
  ///
  /// `SIGCHLD` is still ignored while waiting, so a child that exits before stopping is reaped by
  /// the kernel and the wait fails with `ECHILD`. That is reported as [SandboxError::WaitFailed];
  /// [SandboxError::WaitAnomaly] covers a child that is killed or exits while still waitable.
  pub fn parent_setup(&mut self, child: Pid) -> Result<(), SandboxError> {
    let status = match retry_eintr(|| waitpid(child, Some(WaitPidFlag::WUNTRACED))) {
      Ok(status) => status,
      Err(errno) => fatal(SandboxError::WaitFailed(errno)),
    };

    if let Err(err) = self.restore_sigchld() {
      warn!(pid:? = child; "{err}");
    }

    match status {
      WaitStatus::Stopped(..) => debug!(pid:? = child, status:? = status; "child stopped"),
      status => fatal(SandboxError::WaitAnomaly(status)),
    }

    let installed = self.install(child);

    // Signal the child to start running.
    if let Err(errno) = kill(child, Signal::SIGCONT) {
      fatal(SandboxError::SignalFailure {
        op: "kill: SIGCONT",
        errno,
      });
    }

    match installed {
      Ok(()) => {
        debug!(pid:? = child; "sandbox installed");
        Ok(())
      }
      Err(err) => {
        warn!(pid:? = child; "{err:#}");
        Err(SandboxError::SetupFailed(err))
      }
    }
  }

  fn install(&mut self, child: Pid) -> Result<()> {
    let mut channel = self.device.clone_channel()?;
    channel.attach(child)?;
    self.child = Some(child);
    let channel = self.channel.insert(channel);

    let space = sysno::space();
    let policy = channel.new_policy(space)?;
    channel.assign_policy(policy, child)?;
    // Every syscall gets an explicit verdict, whatever the kernel's default would be.
    for (code, verdict) in self.policy.resolve(space) {
      channel.set_verdict(policy, code, verdict)?;
    }
    Ok(())
  }

  /// Close the control channel. This kills the child if it is still attached and alive.
  pub fn release(mut self) -> Result<(), SandboxError> {
    match self.channel.take() {
      Some(channel) => {
        debug!(pid:? = self.child; "closing control channel");
        drop(channel);
        Ok(())
      }
      None => {
        let err = SandboxError::AlreadyTornDown;
        warn!("{err}");
        Err(err)
      }
    }
  }
}

impl<D: Device> Drop for Sandbox<D> {
  fn drop(&mut self) {
    if !self.sigchld_restored {
      let _ = self.restore_sigchld();
    }
  }
}

/// Fork `workload` into a sandboxed child.
///
/// The child exits with the workload's return value. If the sandbox cannot be installed, the
/// child is killed and reaped before the error is returned.
pub fn spawn<D, F>(device: D, workload: F) -> Result<Sandbox<D>, SandboxError>
where
  D: Device,
  F: FnOnce() -> i32,
{
  let mut sandbox = Sandbox::new(device)?;
  match unsafe { fork() }.map_err(SandboxError::Fork)? {
    ForkResult::Child => {
      if let Err(err) = sandbox.child_setup() {
        fatal(err);
      }
      let status = catch_unwind(AssertUnwindSafe(workload)).unwrap_or(253);
      unsafe { libc::_exit(status) }
    }

    ForkResult::Parent { child } => match sandbox.parent_setup(child) {
      Ok(()) => Ok(sandbox),
      Err(err) => {
        if sandbox.is_attached() {
          let _ = sandbox.release();
        } else if let Err(errno) = kill(child, Signal::SIGKILL) {
          error!(pid:? = child, error:? = errno; "failed to kill process");
        }
        match retry_eintr(|| waitpid(child, None)) {
          Ok(status) => debug!(pid:? = child, status:? = status; "reaped"),
          Err(errno) => warn!(pid:? = child, error:? = errno; "waitpid"),
        }
        Err(err)
      }
    },
  }
}
