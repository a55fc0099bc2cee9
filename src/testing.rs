/// A control device that writes every operation to a trail file instead of talking to the kernel.
///
/// Like systrace, closing a channel that is attached to a live process kills that process.
use std::fs::{read_to_string, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::device::{Channel, Device, PolicyId};
use crate::policy::Verdict;
use crate::sysno::Code;

/// The operation a [RecordingDevice] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  Clone,
  Attach,
  New,
  Assign,
  Modify,
}

/// Append a line to the trail. Safe to call from several processes at once.
pub fn append(trail: &Path, line: &str) -> Result<()> {
  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(trail)
    .with_context(|| format!("open {}", trail.display()))?;
  file
    .write_all(format!("{line}\n").as_bytes())
    .with_context(|| format!("write {}", trail.display()))
}

pub fn read_trail(trail: &Path) -> Vec<String> {
  read_to_string(trail)
    .expect("read trail")
    .lines()
    .map(str::to_string)
    .collect()
}

fn record(trail: &Path, fail: Option<Step>, step: Step, line: &str) -> Result<()> {
  append(trail, line)?;
  if fail == Some(step) {
    bail!("injected failure: {line}");
  }
  Ok(())
}

pub struct RecordingDevice {
  trail: PathBuf,
  fail: Option<Step>,
}

impl RecordingDevice {
  pub fn new(trail: impl AsRef<Path>) -> RecordingDevice {
    RecordingDevice {
      trail: trail.as_ref().to_path_buf(),
      fail: None,
    }
  }

  pub fn failing_at(trail: impl AsRef<Path>, step: Step) -> RecordingDevice {
    RecordingDevice {
      fail: Some(step),
      ..RecordingDevice::new(trail)
    }
  }
}

impl Device for RecordingDevice {
  type Channel = RecordingChannel;

  fn clone_channel(&self) -> Result<RecordingChannel> {
    record(&self.trail, self.fail, Step::Clone, "clone")?;
    Ok(RecordingChannel {
      trail: self.trail.clone(),
      fail: self.fail,
      attached: None,
    })
  }
}

pub struct RecordingChannel {
  trail: PathBuf,
  fail: Option<Step>,
  attached: Option<Pid>,
}

impl Channel for RecordingChannel {
  fn attach(&mut self, pid: Pid) -> Result<()> {
    record(&self.trail, self.fail, Step::Attach, &format!("attach {pid}"))?;
    self.attached = Some(pid);
    Ok(())
  }

  fn new_policy(&mut self, max_entries: Code) -> Result<PolicyId> {
    record(&self.trail, self.fail, Step::New, &format!("new {max_entries}"))?;
    Ok(PolicyId(7))
  }

  fn assign_policy(&mut self, policy: PolicyId, pid: Pid) -> Result<()> {
    let line = format!("assign {} {pid}", policy.0);
    record(&self.trail, self.fail, Step::Assign, &line)
  }

  fn set_verdict(&mut self, policy: PolicyId, code: Code, verdict: Verdict) -> Result<()> {
    let line = format!("modify {} {code} {verdict:?}", policy.0);
    record(&self.trail, self.fail, Step::Modify, &line)
  }
}

impl Drop for RecordingChannel {
  fn drop(&mut self) {
    let _ = append(&self.trail, "close");
    if let Some(pid) = self.attached {
      let _ = kill(pid, Signal::SIGKILL);
    }
  }
}
