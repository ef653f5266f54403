//! Kernel and network statistics records.
//!
//! These are the fixed-size structures the `kstat` and `netstat` syscalls
//! copy into caller-owned memory. Their layout is part of the syscall ABI.

use crate::config::ALLOC_STEPS;
use crate::eth::{EthStats, IFNAMSIZ};

#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct KernelStats {
    /// Interrupt entries that resolved to the entry trampoline itself.
    pub isr_recursion: u32,
    /// Bytes handed out by the bump tier.
    pub heap_used: u32,
    /// Per-size-class slab low-water marks, smallest class first.
    pub alloc_least_free: [u32; ALLOC_STEPS],
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct NetStats {
    pub name: [u8; IFNAMSIZ],
    pub stats: EthStats,
}

impl Default for NetStats {
    fn default() -> Self {
        NetStats {
            name: [0; IFNAMSIZ],
            stats: EthStats::default(),
        }
    }
}

pub fn kstat_get(out: &mut KernelStats) -> i32 {
    out.isr_recursion = crate::irq::isr_recursion();
    out.heap_used = crate::kalloc::heap_used() as u32;
    out.alloc_least_free = crate::kalloc::slab_watermarks();
    0
}

/// Name and counters of the first registered interface. -1 when no
/// interface exists.
pub fn netstat_get(out: &mut NetStats) -> i32 {
    match crate::eth::first_if_stats() {
        Some((name, stats)) => {
            out.name = [0; IFNAMSIZ];
            let n = name.len().min(IFNAMSIZ);
            out.name[..n].copy_from_slice(&name.as_bytes()[..n]);
            out.stats = stats;
            0
        }
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::kernel_lock;

    #[test]
    fn netstat_without_interfaces_fails() {
        let _g = kernel_lock();
        crate::eth::reset_for_test();
        let mut out = NetStats::default();
        assert_eq!(netstat_get(&mut out), -1);
    }

    #[test]
    fn netstat_copies_name_and_counters() {
        let _g = kernel_lock();
        crate::sched::reset_for_test();
        crate::eth::reset_for_test();
        let (drv, _) = crate::eth::testdev::MockDriver::new();
        crate::eth::register_if("eth0", [2, 0, 0, 0, 0, 9], 39, alloc::boxed::Box::new(drv));

        let mut out = NetStats::default();
        assert_eq!(netstat_get(&mut out), 0);
        assert_eq!(&out.name[..4], b"eth0");
        assert_eq!(out.stats.rx_frames, 0);
    }
}
