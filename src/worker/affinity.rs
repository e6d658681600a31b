//! CPU pinning for worker threads.

/// Error from pinning the calling thread.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    #[error("sched_setaffinity to CPU {cpu} failed: {source}")]
    Failed { cpu: usize, source: std::io::Error },

    #[error("CPU {cpu} outside the supported set (max {max})")]
    OutOfRange { cpu: usize, max: usize },

    #[error("CPU pinning is not supported on this platform")]
    Unsupported,
}

/// Restrict the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), AffinityError> {
    let max = 8 * std::mem::size_of::<libc::cpu_set_t>();
    if cpu >= max {
        return Err(AffinityError::OutOfRange { cpu, max });
    }
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(AffinityError::Failed {
                cpu,
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> Result<(), AffinityError> {
    Err(AffinityError::Unsupported)
}
