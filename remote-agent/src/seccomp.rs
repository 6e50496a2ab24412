//! Syscall allowlist for a remote agent that has finished setting up.

use std::collections::BTreeMap;
use std::convert::TryInto;

use devproxy::{Error, Result};
use seccompiler::{SeccompAction, SeccompFilter, SeccompRule};
use tracing::info;

/// Syscalls the dispatch loop, the resample task and logging need once the
/// socket, device and log file exist.
const ALLOWED_SYSCALLS: &[i64] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_readv,
    libc::SYS_writev,
    libc::SYS_recvmsg,
    libc::SYS_sendmsg,
    libc::SYS_recvfrom,
    libc::SYS_sendto,
    libc::SYS_shutdown,
    libc::SYS_close,
    libc::SYS_epoll_pwait,
    libc::SYS_epoll_ctl,
    libc::SYS_ppoll,
    libc::SYS_clock_gettime,
    libc::SYS_clock_nanosleep,
    libc::SYS_nanosleep,
    libc::SYS_futex,
    libc::SYS_mmap,
    libc::SYS_munmap,
    libc::SYS_mremap,
    libc::SYS_mprotect,
    libc::SYS_madvise,
    libc::SYS_brk,
    libc::SYS_fcntl,
    libc::SYS_fstat,
    libc::SYS_newfstatat,
    libc::SYS_dup,
    libc::SYS_eventfd2,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_rt_sigreturn,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_sigaltstack,
    libc::SYS_clone,
    libc::SYS_clone3,
    libc::SYS_set_robust_list,
    libc::SYS_rseq,
    libc::SYS_getrandom,
    libc::SYS_getpid,
    libc::SYS_gettid,
    libc::SYS_tgkill,
    libc::SYS_sched_yield,
    libc::SYS_sched_getaffinity,
    libc::SYS_prctl,
    libc::SYS_seccomp,
];

#[cfg(target_arch = "x86_64")]
const ARCH_SYSCALLS: &[i64] = &[libc::SYS_epoll_wait, libc::SYS_poll];

#[cfg(not(target_arch = "x86_64"))]
const ARCH_SYSCALLS: &[i64] = &[];

/// Install the filter on the calling thread. Threads spawned afterwards
/// inherit it; a disallowed syscall kills the process.
pub fn install_filter() -> Result<()> {
    let rules: BTreeMap<i64, Vec<SeccompRule>> = ALLOWED_SYSCALLS
        .iter()
        .chain(ARCH_SYSCALLS)
        .map(|&syscall| (syscall, Vec::new()))
        .collect();
    let count = rules.len();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        std::env::consts::ARCH
            .try_into()
            .map_err(|_| Error::Config("Unsupported architecture for seccomp".into()))?,
    )
    .map_err(|e| Error::Config(format!("Failed to create seccomp filter: {:?}", e)))?;

    let bpf_prog: seccompiler::BpfProgram = filter
        .try_into()
        .map_err(|e| Error::Config(format!("Failed to compile seccomp filter: {:?}", e)))?;

    seccompiler::apply_filter(&bpf_prog)
        .map_err(|e| Error::Config(format!("Failed to apply seccomp filter: {:?}", e)))?;

    info!("Seccomp-BPF filter installed ({} syscalls allowed)", count);
    Ok(())
}
