/// The pre-authentication syscall policy.
///
/// This is a positive allow-list: a syscall that is not listed here gets [Verdict::Kill].
use crate::sysno::{self, Code};

/// What happens when the sandboxed process issues a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
  /// The syscall is executed normally.
  Permit,
  /// The syscall fails with an error, the process keeps running.
  Never,
  /// The process is killed.
  Kill,
}

/// One entry of a [Policy].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
  pub code: Code,
  pub verdict: Verdict,
}

const fn permit(code: Code) -> Rule {
  Rule {
    code,
    verdict: Verdict::Permit,
  }
}

/// An immutable syscall policy.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
  rules: &'static [Rule],
}

const PREAUTH_RULES: &[Rule] = &[
  #[cfg(any(target_os = "openbsd", target_arch = "x86_64"))]
  Rule {
    code: sysno::OPEN,
    verdict: Verdict::Never,
  },
  permit(sysno::SYSINFO),
  permit(sysno::CLOSE),
  permit(sysno::EXIT),
  #[cfg(target_os = "linux")]
  permit(sysno::EXIT_GROUP),
  permit(sysno::GETPID),
  permit(sysno::GETTIMEOFDAY),
  permit(sysno::CLOCK_GETTIME),
  permit(sysno::MADVISE),
  permit(sysno::MMAP),
  permit(sysno::MPROTECT),
  #[cfg(target_os = "openbsd")]
  permit(sysno::MQUERY),
  #[cfg(any(target_os = "openbsd", target_arch = "x86_64"))]
  permit(sysno::POLL),
  #[cfg(target_os = "linux")]
  permit(sysno::PPOLL),
  permit(sysno::MUNMAP),
  permit(sysno::READ),
  permit(sysno::SIGPROCMASK),
  permit(sysno::WRITE),
];

/// The policy applied to a freshly sandboxed child.
pub static PREAUTH: Policy = Policy {
  rules: PREAUTH_RULES,
};

impl Policy {
  /// Build a policy from a static rule list.
  pub const fn new(rules: &'static [Rule]) -> Policy {
    Policy { rules }
  }

  /// The explicitly listed rules.
  pub fn rules(&self) -> &'static [Rule] {
    self.rules
  }

  /// The verdict for a single syscall.
  pub fn lookup(&self, code: Code) -> Verdict {
    self
      .rules
      .iter()
      .find(|rule| rule.code == code)
      .map_or(Verdict::Kill, |rule| rule.verdict)
  }

  /// Every syscall identity in `0..space`, each paired with its verdict.
  pub fn resolve(&self, space: Code) -> impl Iterator<Item = (Code, Verdict)> + '_ {
    (0..space).map(move |code| (code, self.lookup(code)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::collections::HashSet;

  #[test]
  fn it_permits_the_allow_list() {
    for code in [
      sysno::READ,
      sysno::WRITE,
      sysno::CLOSE,
      sysno::EXIT,
      sysno::GETPID,
      sysno::CLOCK_GETTIME,
      sysno::GETTIMEOFDAY,
      sysno::MMAP,
      sysno::MUNMAP,
      sysno::MPROTECT,
      sysno::MADVISE,
      sysno::SIGPROCMASK,
      sysno::SYSINFO,
    ] {
      assert_eq!(PREAUTH.lookup(code), Verdict::Permit, "{:?}", sysno::name(code));
    }
  }

  #[test]
  #[cfg(any(target_os = "openbsd", target_arch = "x86_64"))]
  fn it_never_allows_open() {
    assert_eq!(PREAUTH.lookup(sysno::OPEN), Verdict::Never);
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn it_kills_unlisted_syscalls() {
    use syscalls::Sysno;

    for sysno in [Sysno::openat, Sysno::socket, Sysno::execve, Sysno::kill] {
      assert_eq!(PREAUTH.lookup(sysno as Code), Verdict::Kill, "{}", sysno.name());
    }
  }

  #[test]
  fn it_lists_each_syscall_once() {
    let mut seen = HashSet::new();
    for rule in PREAUTH.rules() {
      assert!(seen.insert(rule.code), "duplicate rule for {}", rule.code);
    }
    assert!(PREAUTH.rules().len() >= 15);
  }

  #[test]
  fn resolve_covers_the_whole_space() {
    let space = sysno::space();
    let resolved = PREAUTH.resolve(space).collect::<Vec<_>>();
    assert_eq!(resolved.len(), space as usize);
    for (i, (code, verdict)) in resolved.iter().enumerate() {
      assert_eq!(*code, i as Code);
      let listed = PREAUTH.rules().iter().find(|rule| rule.code == *code);
      match listed {
        Some(rule) => assert_eq!(*verdict, rule.verdict),
        None => assert_eq!(*verdict, Verdict::Kill),
      }
    }
    let permitted = resolved
      .iter()
      .filter(|(_, verdict)| *verdict == Verdict::Permit)
      .count();
    assert_eq!(
      permitted,
      PREAUTH
        .rules()
        .iter()
        .filter(|rule| rule.verdict == Verdict::Permit)
        .count()
    );
  }

  #[test]
  fn custom_policies_default_to_kill() {
    static RULES: &[Rule] = &[permit(sysno::READ)];
    let policy = Policy::new(RULES);
    assert_eq!(policy.lookup(sysno::READ), Verdict::Permit);
    assert_eq!(policy.lookup(sysno::WRITE), Verdict::Kill);
  }
}
