//! Syscall identities of the host kernel.
//!
//! The policy table is written against these numbers, and the installer walks `0..space()` so
//! that every identity the kernel knows about receives an explicit verdict.

/// Raw syscall number, as the kernel control channel expects it.
pub type Code = u32;

#[cfg(target_os = "linux")]
mod imp {
  use super::Code;
  use syscalls::Sysno;

  #[cfg(target_arch = "x86_64")]
  pub const OPEN: Code = Sysno::open as Code;

  pub const EXIT: Code = Sysno::exit as Code;
  pub const EXIT_GROUP: Code = Sysno::exit_group as Code;
  pub const READ: Code = Sysno::read as Code;
  pub const WRITE: Code = Sysno::write as Code;
  pub const CLOSE: Code = Sysno::close as Code;
  pub const GETPID: Code = Sysno::getpid as Code;
  pub const GETTIMEOFDAY: Code = Sysno::gettimeofday as Code;
  pub const CLOCK_GETTIME: Code = Sysno::clock_gettime as Code;
  pub const MADVISE: Code = Sysno::madvise as Code;
  pub const MMAP: Code = Sysno::mmap as Code;
  pub const MPROTECT: Code = Sysno::mprotect as Code;
  pub const MUNMAP: Code = Sysno::munmap as Code;
  pub const PPOLL: Code = Sysno::ppoll as Code;
  #[cfg(target_arch = "x86_64")]
  pub const POLL: Code = Sysno::poll as Code;
  pub const SIGPROCMASK: Code = Sysno::rt_sigprocmask as Code;
  pub const SYSINFO: Code = Sysno::uname as Code;

  pub fn space() -> Code {
    Sysno::last() as Code + 1
  }

  pub fn name(code: Code) -> Option<&'static str> {
    Sysno::new(code as usize).map(|sysno| sysno.name())
  }
}

/// Numbers from the OpenBSD 5.5 `<sys/syscall.h>`, the last release shipping systrace(4).
#[cfg(target_os = "openbsd")]
mod imp {
  use super::Code;

  pub const OPEN: Code = 5;

  pub const EXIT: Code = 1;
  pub const READ: Code = 3;
  pub const WRITE: Code = 4;
  pub const CLOSE: Code = 6;
  pub const GETPID: Code = 20;
  pub const SIGPROCMASK: Code = 48;
  pub const GETTIMEOFDAY: Code = 67;
  pub const MUNMAP: Code = 73;
  pub const MPROTECT: Code = 74;
  pub const MADVISE: Code = 75;
  pub const CLOCK_GETTIME: Code = 87;
  pub const MMAP: Code = 197;
  pub const SYSINFO: Code = 202;
  pub const POLL: Code = 252;
  pub const MQUERY: Code = 286;

  const MAXSYSCALL: Code = 330;

  pub fn space() -> Code {
    MAXSYSCALL
  }

  pub fn name(code: Code) -> Option<&'static str> {
    Some(match code {
      1 => "exit",
      3 => "read",
      4 => "write",
      5 => "open",
      6 => "close",
      20 => "getpid",
      48 => "sigprocmask",
      67 => "gettimeofday",
      73 => "munmap",
      74 => "mprotect",
      75 => "madvise",
      87 => "clock_gettime",
      197 => "mmap",
      202 => "__sysctl",
      252 => "poll",
      286 => "mquery",
      _ => return None,
    })
  }
}

pub use imp::*;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn space_covers_the_table() {
    for code in [EXIT, READ, WRITE, CLOSE, GETPID, MMAP, SYSINFO] {
      assert!(code < space(), "{code} outside of 0..{}", space());
    }
  }

  #[test]
  fn names_known_syscalls() {
    assert_eq!(name(READ), Some("read"));
    assert_eq!(name(CLOSE), Some("close"));
  }
}
