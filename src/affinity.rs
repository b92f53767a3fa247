//! CPU topology and thread placement queries
//!
//! Every function here asks the operating system afresh; nothing is cached
//! between calls, so results track hotplug and cgroup changes.

use tracing::debug;

/// Number of logical CPUs available to this process
pub fn num_cores() -> usize {
    num_cpus::get().max(1)
}

/// Pin the calling thread to the `index`-th allowed core
///
/// The index wraps around the set of cores this process may run on, so
/// callers can pass a worker number directly. Returns `false` when pinning
/// is unsupported or refused; callers treat that as reduced fidelity only.
pub fn pin_current_thread(index: usize) -> bool {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        debug!("Core affinity is not supported on this platform");
        return false;
    };
    if core_ids.is_empty() {
        return false;
    }

    let core = core_ids[index % core_ids.len()];
    let pinned = core_affinity::set_for_current(core);
    if !pinned {
        debug!("Failed to pin thread to core {}", core.id);
    }
    pinned
}

/// Allow the calling thread to run on every CPU again
#[cfg(target_os = "linux")]
pub fn reset_current_thread() -> bool {
    // SAFETY: cpu_set_t is plain data; the kernel intersects the mask with
    // the CPUs this thread is actually permitted to use.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..(libc::CPU_SETSIZE as usize) {
            libc::CPU_SET(cpu, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn reset_current_thread() -> bool {
    false
}

/// CPUs the calling thread is currently allowed to run on
#[cfg(target_os = "linux")]
pub fn current_affinity() -> Vec<usize> {
    // SAFETY: the set is fully initialized before sched_getaffinity fills it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Vec::new();
        }
        (0..(libc::CPU_SETSIZE as usize))
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect()
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_affinity() -> Vec<usize> {
    (0..num_cores()).collect()
}
