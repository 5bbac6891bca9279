//! Best-effort latency tuning for the measuring process.
//!
//! Every step may fail without privileges; failures are logged and the run
//! continues with whatever was applied.

use std::io;
use tracing::{info, warn};

/// SCHED_FIFO priority requested for the process.
pub const FIFO_PRIORITY: i32 = 80;

/// Apply scheduling, affinity and memory locking.
pub fn prepare(cpu: usize) {
    match set_fifo_priority(FIFO_PRIORITY) {
        Ok(()) => info!(priority = FIFO_PRIORITY, "Using SCHED_FIFO"),
        Err(e) => warn!(error = %e, "Could not raise scheduling priority"),
    }
    match pin_to_cpu(cpu) {
        Ok(()) => info!(cpu, "Pinned to CPU"),
        Err(e) => warn!(cpu, error = %e, "Could not pin to CPU"),
    }
    if let Err(e) = lock_memory() {
        warn!(error = %e, "Could not lock memory");
    }
}

#[cfg(target_os = "linux")]
fn set_fifo_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: param is a valid sched_param for the duration of the call.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cpu index out of range",
        ));
    }
    // SAFETY: cpu_set_t is plain data and cpu is within CPU_SETSIZE.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn lock_memory() -> io::Result<()> {
    // SAFETY: no pointers are involved.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_fifo_priority(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "Linux only"))
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "Linux only"))
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "Linux only"))
}
