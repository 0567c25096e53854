//! Hand-rolled cBPF seccomp filter compiler (spec.md §4.8). No libseccomp
//! binding: the program is built instruction-by-instruction the way
//! `sandbox.rs`'s allow-list installer does it, generalized from a fixed
//! allow-list to an arbitrary policy of architectures + syscall rules.

use std::collections::HashMap;

use oci_spec::runtime::{Arch, LinuxSeccomp, LinuxSeccompAction};
use tracing::warn;

use crate::core::error::{Error, ErrorKind, Result};

#[repr(C)]
#[derive(Clone, Copy)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

/// Offsets into the kernel's `struct seccomp_data`.
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_NR_OFFSET: u32 = 0;

const AUDIT_ARCH_X86_64: u32 = 0xC000003E;
const AUDIT_ARCH_I386: u32 = 0x40000003;
const AUDIT_ARCH_AARCH64: u32 = 0xC00000B7;
const AUDIT_ARCH_ARM: u32 = 0x40000028;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x80000000;
const SECCOMP_RET_TRAP: u32 = 0x00030000;
const SECCOMP_RET_ERRNO: u32 = 0x00050000;
const SECCOMP_RET_TRACE: u32 = 0x7FF00000;
const SECCOMP_RET_LOG: u32 = 0x7FFC0000;
const SECCOMP_RET_ALLOW: u32 = 0x7FFF0000;

/// Fraction of unrecognized syscall names above which the whole filter is
/// abandoned rather than installed incomplete.
const UNKNOWN_SYSCALL_ABANDON_FRACTION: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Log,
    Errno(u16),
    Trap,
    Trace,
    KillThread,
    KillProcess,
}

impl Action {
    fn to_ret(self) -> u32 {
        match self {
            Action::Allow => SECCOMP_RET_ALLOW,
            Action::Log => SECCOMP_RET_LOG,
            Action::Errno(errno) => SECCOMP_RET_ERRNO | (errno as u32 & 0xFFFF),
            Action::Trap => SECCOMP_RET_TRAP,
            Action::Trace => SECCOMP_RET_TRACE,
            // cBPF has no distinct "kill thread" return; the reference
            // kernel encoding for SECCOMP_RET_KILL is what KILL_THREAD maps
            // to, distinct from the KILL_PROCESS used for arch mismatch.
            Action::KillThread => 0x00000000,
            Action::KillProcess => SECCOMP_RET_KILL_PROCESS,
        }
    }
}

pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: Action,
}

pub struct Policy {
    pub default_action: Action,
    pub architectures: Vec<String>,
    pub rules: Vec<SyscallRule>,
}

fn arch_name(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::X86_64 => Some("x86_64"),
        Arch::X86 => Some("x86"),
        Arch::AARCH64 => Some("aarch64"),
        Arch::ARM => Some("arm"),
        _ => None,
    }
}

fn action_from_spec(action: LinuxSeccompAction, errno_ret: Option<u32>) -> Action {
    match action {
        LinuxSeccompAction::Allow => Action::Allow,
        LinuxSeccompAction::Log => Action::Log,
        LinuxSeccompAction::Errno => Action::Errno(errno_ret.unwrap_or(libc::EPERM as u32) as u16),
        LinuxSeccompAction::Trap => Action::Trap,
        LinuxSeccompAction::Trace => Action::Trace,
        LinuxSeccompAction::Kill => Action::KillThread,
        LinuxSeccompAction::KillProcess => Action::KillProcess,
        LinuxSeccompAction::KillThread => Action::KillThread,
    }
}

/// Translate the config's `linux.seccomp` section into this compiler's
/// internal `Policy`. Argument predicates (`LinuxSeccompArg`) are out of
/// scope for this core (spec.md §4.8) and are dropped here, not enforced.
pub fn policy_from_spec(seccomp: &LinuxSeccomp) -> Option<Policy> {
    let architectures: Vec<String> = seccomp
        .architectures()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(arch_name)
        .map(str::to_string)
        .collect();

    let rules = seccomp
        .syscalls()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|s| SyscallRule {
            names: s.names().clone(),
            action: action_from_spec(s.action(), s.errno_ret().clone()),
        })
        .collect();

    Some(Policy {
        default_action: action_from_spec(seccomp.default_action(), None),
        architectures,
        rules,
    })
}

fn audit_arch_for(name: &str) -> Option<u32> {
    match name {
        "x86_64" => Some(AUDIT_ARCH_X86_64),
        "x86" => Some(AUDIT_ARCH_I386),
        "aarch64" => Some(AUDIT_ARCH_AARCH64),
        "arm" => Some(AUDIT_ARCH_ARM),
        _ => None,
    }
}

/// Build the syscall name -> number table for this compiler. Only a subset
/// is enumerated here; names absent from the table are treated as
/// "unrecognized" per spec.md §4.8's unknown-syscall policy.
fn syscall_table() -> &'static HashMap<&'static str, i64> {
    use std::sync::OnceLock;
    static TABLE: OnceLock<HashMap<&'static str, i64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        // x86_64 syscall numbers for a broad common subset (spec.md §4.8
        // scopes argument predicates and exhaustive coverage out; the
        // practical runtime ships the syscalls a typical container issues).
        [
            ("read", 0), ("write", 1), ("open", 2), ("close", 3), ("stat", 4),
            ("fstat", 5), ("lstat", 6), ("poll", 7), ("lseek", 8), ("mmap", 9),
            ("mprotect", 10), ("munmap", 11), ("brk", 12), ("rt_sigaction", 13),
            ("rt_sigprocmask", 14), ("ioctl", 16), ("pread64", 17), ("pwrite64", 18),
            ("readv", 19), ("writev", 20), ("access", 21), ("pipe", 22),
            ("select", 23), ("sched_yield", 24), ("mremap", 25), ("msync", 26),
            ("dup", 32), ("dup2", 33), ("pause", 34), ("nanosleep", 35),
            ("getpid", 39), ("socket", 41), ("connect", 42), ("accept", 43),
            ("sendto", 44), ("recvfrom", 45), ("sendmsg", 46), ("recvmsg", 47),
            ("shutdown", 48), ("bind", 49), ("listen", 50), ("getsockname", 51),
            ("getpeername", 52), ("socketpair", 53), ("clone", 56), ("fork", 57),
            ("vfork", 58), ("execve", 59), ("exit", 60), ("wait4", 61),
            ("kill", 62), ("uname", 63), ("fcntl", 72), ("flock", 73),
            ("fsync", 74), ("getcwd", 79), ("chdir", 80), ("rename", 82),
            ("mkdir", 83), ("rmdir", 84), ("creat", 85), ("link", 86),
            ("unlink", 87), ("symlink", 88), ("readlink", 89), ("chmod", 90),
            ("chown", 92), ("umask", 95), ("gettimeofday", 96), ("getrlimit", 97),
            ("getuid", 102), ("getgid", 104), ("setuid", 105), ("setgid", 106),
            ("geteuid", 107), ("getegid", 108), ("setpgid", 109), ("getppid", 110),
            ("setsid", 112), ("setreuid", 113), ("setregid", 114),
            ("getgroups", 115), ("setgroups", 116), ("setresuid", 117),
            ("getresuid", 118), ("setresgid", 119), ("getresgid", 120),
            ("prctl", 157), ("arch_prctl", 158), ("sethostname", 170),
            ("chroot", 161), ("setrlimit", 160), ("mount", 165), ("umount2", 166),
            ("pivot_root", 155), ("gettid", 186), ("futex", 202),
            ("sched_setaffinity", 203), ("sched_getaffinity", 204),
            ("set_tid_address", 218), ("clock_gettime", 228), ("clock_getres", 229),
            ("exit_group", 231), ("epoll_wait", 232), ("epoll_ctl", 233),
            ("tgkill", 234), ("openat", 257), ("mkdirat", 258), ("mknodat", 259),
            ("unlinkat", 263), ("renameat", 264), ("linkat", 265),
            ("symlinkat", 266), ("readlinkat", 267), ("fchmodat", 268),
            ("faccessat", 269), ("pselect6", 270), ("ppoll", 271),
            ("epoll_pwait", 281), ("fallocate", 285), ("eventfd2", 290),
            ("epoll_create1", 291), ("dup3", 292), ("pipe2", 293),
            ("prlimit64", 302), ("getrandom", 318), ("setns", 308),
            ("unshare", 272), ("capset", 126), ("capget", 125), ("statx", 332),
            ("clone3", 435),
        ]
        .into_iter()
        .collect()
    })
}

/// Compile a policy into a cBPF program, or `None` if the policy is
/// abandoned (no installable architectures, or too many unrecognized
/// syscall names — spec.md §4.8).
pub fn compile(policy: &Policy) -> Result<Option<Vec<u8>>> {
    let archs: Vec<u32> = policy
        .architectures
        .iter()
        .filter_map(|a| audit_arch_for(a))
        .collect();
    if archs.is_empty() {
        warn!("seccomp policy names no recognized architecture; filter abandoned");
        return Ok(None);
    }

    let table = syscall_table();
    let mut resolved: Vec<(i64, Action)> = Vec::new();
    let mut total_names = 0usize;
    let mut unknown_names = 0usize;

    for rule in &policy.rules {
        for name in &rule.names {
            total_names += 1;
            match table.get(name.as_str()) {
                Some(nr) => resolved.push((*nr, rule.action)),
                None => unknown_names += 1,
            }
        }
    }

    if total_names > 0 {
        let fraction = unknown_names as f64 / total_names as f64;
        if fraction > UNKNOWN_SYSCALL_ABANDON_FRACTION {
            warn!(
                unknown_names,
                total_names, "too many unrecognized syscall names; seccomp filter abandoned"
            );
            return Ok(None);
        }
    }

    Ok(Some(build_program(&archs, &resolved, policy.default_action)))
}

fn build_program(archs: &[u32], rules: &[(i64, Action)], default_action: Action) -> Vec<u8> {
    let a = archs.len();
    let mut prog: Vec<SockFilter> = Vec::with_capacity(2 + a + rules.len() * 2 + 1);

    // 0: ld [offsetof(arch)]
    prog.push(SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: SECCOMP_DATA_ARCH_OFFSET,
    });

    // 1..A: jeq ALLOWED_AUDIT_ARCH[i], jt = (A - i), jf = 0
    for (i, arch) in archs.iter().enumerate() {
        prog.push(SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: (a - i) as u8,
            jf: 0,
            k: *arch,
        });
    }

    // A+1: ret KILL_PROCESS (arch mismatch trap)
    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: SECCOMP_RET_KILL_PROCESS,
    });

    // A+2: ld [offsetof(nr)]
    prog.push(SockFilter {
        code: BPF_LD | BPF_W | BPF_ABS,
        jt: 0,
        jf: 0,
        k: SECCOMP_DATA_NR_OFFSET,
    });

    // For each syscall rule: jeq NR, jt=0, jf=1 ; ret ACTION_RET
    for (nr, action) in rules {
        prog.push(SockFilter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: *nr as u32,
        });
        prog.push(SockFilter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: action.to_ret(),
        });
    }

    // last: ret DEFAULT_ACTION
    prog.push(SockFilter {
        code: BPF_RET | BPF_K,
        jt: 0,
        jf: 0,
        k: default_action.to_ret(),
    });

    // Serialize as raw bytes so the caller doesn't need the repr(C) types
    // to survive the fork/exec boundary as anything but a byte buffer.
    let ptr = prog.as_ptr() as *const u8;
    let len = prog.len() * std::mem::size_of::<SockFilter>();
    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// Install a compiled program via `prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER, ...)`.
/// The caller must have already set `PR_SET_NO_NEW_PRIVS` (mandatory for
/// unprivileged seccomp installation, also required independently by
/// spec.md §4.10 init-stage ordering).
pub fn install(program: &[u8], id: &str) -> Result<()> {
    let n_filters = program.len() / std::mem::size_of::<SockFilter>();
    let fprog = SockFprog {
        len: n_filters as u16,
        filter: program.as_ptr() as *const SockFilter,
    };

    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &fprog as *const SockFprog as libc::c_ulong,
            0,
            0,
        )
    };
    if ret != 0 {
        return Err(Error::msg(
            "install_seccomp",
            ErrorKind::Seccomp,
            std::io::Error::last_os_error(),
        )
        .with_id(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_architecture_is_filtered_not_fatal() {
        let policy = Policy {
            default_action: Action::Errno(1),
            architectures: vec!["mips".to_string()],
            rules: vec![],
        };
        let compiled = compile(&policy).unwrap();
        assert!(compiled.is_none());
    }

    #[test]
    fn known_architecture_compiles_a_program() {
        let policy = Policy {
            default_action: Action::Errno(1),
            architectures: vec!["x86_64".to_string()],
            rules: vec![SyscallRule {
                names: vec!["read".to_string(), "write".to_string()],
                action: Action::Allow,
            }],
        };
        let compiled = compile(&policy).unwrap();
        assert!(compiled.is_some());
    }

    #[test]
    fn abandons_filter_when_over_20_percent_unknown() {
        let policy = Policy {
            default_action: Action::Errno(1),
            architectures: vec!["x86_64".to_string()],
            rules: vec![SyscallRule {
                names: vec![
                    "read".to_string(),
                    "made_up_syscall_1".to_string(),
                    "made_up_syscall_2".to_string(),
                ],
                action: Action::Allow,
            }],
        };
        let compiled = compile(&policy).unwrap();
        assert!(compiled.is_none());
    }

    #[test]
    fn tolerates_a_minority_of_unknown_names() {
        let policy = Policy {
            default_action: Action::Errno(1),
            architectures: vec!["x86_64".to_string()],
            rules: vec![SyscallRule {
                names: vec![
                    "read".to_string(),
                    "write".to_string(),
                    "open".to_string(),
                    "close".to_string(),
                    "made_up_syscall".to_string(),
                ],
                action: Action::Allow,
            }],
        };
        let compiled = compile(&policy).unwrap();
        assert!(compiled.is_some());
    }
}
