//! Real-time scheduling for the serve loop (Linux SCHED_FIFO, CPU affinity, mlockall).

use crate::cli::RtLock;

#[derive(Debug, Clone, Copy)]
pub struct RtOptions {
    pub prio: Option<i32>,
    pub lock: RtLock,
    pub cpu: Option<usize>,
}

/// Apply `opts` once per process. Every step is best effort: failures are
/// logged and the loop runs with whatever was granted.
#[cfg(target_os = "linux")]
pub fn setup_rt_once(opts: RtOptions) {
    use std::sync::OnceLock;
    static RT_ONCE: OnceLock<()> = OnceLock::new();

    RT_ONCE.get_or_init(|| {
        match linux::lock_memory(opts.lock) {
            Ok(()) => tracing::info!(lock = ?opts.lock, "rt: memory lock applied"),
            Err(e) => tracing::warn!(error = %e, "rt: mlockall failed"),
        }
        match linux::set_fifo_priority(opts.prio) {
            Ok(prio) => tracing::info!(prio, "rt: SCHED_FIFO enabled"),
            Err(e) => tracing::warn!(error = %e, "rt: SCHED_FIFO not applied"),
        }
        let cpu = opts.cpu.unwrap_or(0);
        match linux::pin_to_cpu(cpu) {
            Ok(()) => tracing::info!(cpu, "rt: pinned to cpu"),
            Err(e) => tracing::warn!(error = %e, "rt: affinity not applied"),
        }
    });
}

#[cfg(not(target_os = "linux"))]
pub fn setup_rt_once(opts: RtOptions) {
    tracing::warn!(?opts, "rt: real-time mode is only supported on Linux; ignoring --rt");
}

#[cfg(target_os = "linux")]
mod linux {
    use crate::cli::RtLock;

    /// Capacity of cpu_set_t in CPU indices (bits).
    const MAX_CPUSET_BITS: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;
    /// CAP_SYS_NICE in the capability bitmask.
    const CAP_SYS_NICE_BIT: u64 = 1 << 23;

    fn check(rc: libc::c_int) -> std::io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn memlock_hint(err: &std::io::Error) -> Option<String> {
        if !matches!(err.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::ENOMEM)
        {
            return None;
        }
        let mut rlim = std::mem::MaybeUninit::<libc::rlimit>::uninit();
        // SAFETY: getrlimit writes a full rlimit on success.
        let limit = unsafe {
            if libc::getrlimit(libc::RLIMIT_MEMLOCK, rlim.as_mut_ptr()) == 0 {
                let cur = rlim.assume_init().rlim_cur;
                if cur == libc::RLIM_INFINITY {
                    "unlimited".to_string()
                } else {
                    format!("{} KiB", cur / 1024)
                }
            } else {
                "unknown".to_string()
            }
        };
        Some(format!(
            "memlock limit: {limit}; needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'"
        ))
    }

    pub fn lock_memory(lock: RtLock) -> eyre::Result<()> {
        let flags = match lock {
            RtLock::None => return Ok(()),
            RtLock::Current => libc::MCL_CURRENT,
            RtLock::All => libc::MCL_CURRENT | libc::MCL_FUTURE,
        };
        // SAFETY: mlockall takes plain flags.
        let Err(err) = check(unsafe { libc::mlockall(flags) }) else {
            return Ok(());
        };
        if lock == RtLock::All {
            // Fall back to the resident pages only.
            // SAFETY: as above.
            if check(unsafe { libc::mlockall(libc::MCL_CURRENT) }).is_ok() {
                tracing::warn!(error = %err, "rt: mlockall(current|future) failed; locked current pages only");
                return Ok(());
            }
        }
        match memlock_hint(&err) {
            Some(hint) => eyre::bail!("mlockall failed: {err}; {hint}"),
            None => eyre::bail!("mlockall failed: {err}"),
        }
    }

    fn has_sys_nice() -> bool {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } == 0 {
            return true;
        }
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return true;
        };
        status
            .lines()
            .filter_map(|line| line.strip_prefix("CapEff:"))
            .filter_map(|hex| u64::from_str_radix(hex.trim(), 16).ok())
            .any(|caps| caps & CAP_SYS_NICE_BIT != 0)
    }

    /// Switch to SCHED_FIFO at `prio` (clamped), or the maximum when unset.
    pub fn set_fifo_priority(prio: Option<i32>) -> eyre::Result<i32> {
        if !has_sys_nice() {
            eyre::bail!(
                "needs CAP_SYS_NICE or root; try 'sudo setcap cap_sys_nice=ep /path/to/pendule'"
            );
        }
        // SAFETY: plain queries on a policy constant.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(libc::SCHED_FIFO),
                libc::sched_get_priority_max(libc::SCHED_FIFO),
            )
        };
        let (min, max) = if min < 0 || max < 0 { (1, 99) } else { (min, max) };
        let value = prio.unwrap_or(max).clamp(min, max);
        let param = libc::sched_param {
            sched_priority: value,
        };
        // SAFETY: param outlives the call.
        check(unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) })?;
        Ok(value)
    }

    pub fn pin_to_cpu(cpu: usize) -> eyre::Result<()> {
        if cpu >= MAX_CPUSET_BITS {
            eyre::bail!("cpu {cpu} exceeds cpu_set_t capacity {MAX_CPUSET_BITS}");
        }
        // SAFETY: cpu_set_t is plain data; the CPU_* helpers stay within its bits.
        unsafe {
            let mut allowed: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut allowed);
            check(libc::sched_getaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &mut allowed,
            ))?;
            if !libc::CPU_ISSET(cpu, &allowed) {
                eyre::bail!("cpu {cpu} is not permitted by the current affinity mask");
            }
            let mut desired: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut desired);
            libc::CPU_SET(cpu, &mut desired);
            check(libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &desired,
            ))?;
        }
        Ok(())
    }

}
