//! CPU core reservation for decode workers.
//!
//! Decode workers each pin themselves to a dedicated logical core so codec
//! worker threads and the render thread do not steal their cache. Cores are
//! handed out from the top of the range downward; the low cores are left to
//! the kernel, interrupt handlers, and the (unpinned) render thread.

use parking_lot::Mutex;

/// Low cores never handed to workers.
const RESERVED_LOW_CORES: usize = 2;

/// Process-wide dedicated-core allocator. Each call hands out a distinct
/// core; when the machine runs out, workers simply run unpinned.
#[derive(Debug)]
pub struct CoreAllocator {
    next: Mutex<usize>,
    reserved_low: usize,
    total: usize,
}

impl CoreAllocator {
    pub fn new() -> Self {
        Self::with_topology(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            RESERVED_LOW_CORES,
        )
    }

    fn with_topology(total: usize, reserved_low: usize) -> Self {
        Self {
            next: Mutex::new(total),
            reserved_low,
            total,
        }
    }

    /// Reserve the next free dedicated core, highest first.
    pub fn allocate(&self) -> Option<usize> {
        let mut next = self.next.lock();
        if *next <= self.reserved_low {
            return None;
        }
        *next -= 1;
        Some(*next)
    }

    pub fn total_cores(&self) -> usize {
        self.total
    }
}

impl Default for CoreAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Pin the calling thread to a single logical core. Failure is survivable:
/// the worker keeps running wherever the scheduler puts it.
pub fn pin_current_thread(core: usize) -> bool {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(core, "sched_setaffinity failed, worker runs unpinned");
            return false;
        }
        tracing::debug!(core, "decode worker pinned");
        true
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = core;
        tracing::warn!("thread pinning unsupported on this platform");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cores_are_unique_and_descend() {
        let alloc = CoreAllocator::with_topology(4, 2);
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn low_cores_are_never_assigned() {
        let alloc = CoreAllocator::with_topology(8, 2);
        let mut seen = Vec::new();
        while let Some(core) = alloc.allocate() {
            seen.push(core);
        }
        assert_eq!(seen, vec![7, 6, 5, 4, 3, 2]);
        assert!(!seen.contains(&0) && !seen.contains(&1));
    }

    #[test]
    fn tiny_machines_get_no_pinning() {
        let alloc = CoreAllocator::with_topology(2, 2);
        assert_eq!(alloc.allocate(), None);
        let alloc = CoreAllocator::with_topology(1, 2);
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn allocations_are_unique_across_threads() {
        use std::sync::Arc;
        let alloc = Arc::new(CoreAllocator::with_topology(16, 2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || alloc.allocate()));
        }
        let mut cores: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        cores.sort_unstable();
        cores.dedup();
        assert_eq!(cores.len(), 8);
    }

    #[test]
    fn pinning_to_core_zero_of_this_machine() {
        // Core 0 always exists; on non-Linux this is expected to just warn.
        let _ = pin_current_thread(0);
    }
}
