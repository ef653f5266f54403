//! # emberOS — a small preemptible real-time kernel
//!
//! A single-core kernel for ARM9-class boards: round-robin scheduling with
//! per-task software timers, a numbered syscall boundary between user and
//! system tasks, vectored interrupt dispatch, completions/events/semaphores,
//! a two-tier allocator, and an interrupt-driven Ethernet path up through
//! ARP, IPv4, ICMP and UDP.
//!
//! ## Layout
//! - Everything hardware-independent lives at the crate root and compiles
//!   on the host, where the unit tests run against plain memory.
//! - `arch/` holds the board support (CPU modes, controllers, timer, UART,
//!   MAC) and only builds for the ARM target.
//!
//! ## Boot flow
//! 1. **Memory** — bump tier, then the slab carve-out.
//! 2. **Arch** — trap vectors, interrupt controllers, tick timer, console.
//! 3. **Scheduler** — idle task created and made current.
//! 4. Interrupts on, Ethernet up, boot tasks spawned, scheduler enabled.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod fifo;
pub mod kalloc;
pub mod time;
pub mod irq;
pub mod sync;
pub mod sched;
pub mod syscall;
pub mod stdio;
pub mod uart;
pub mod cons;
pub mod kstat;
pub mod fault;
pub mod pkt;
pub mod eth;
pub mod arp;
pub mod ip;
pub mod icmp;
pub mod udp;

#[cfg(target_arch = "arm")]
pub mod arch;

// ── Architecture shims ──────────────────────────────────────────────────────
// The portable kernel reaches the CPU through these. On the host they are
// inert so the logic above them stays testable.

#[inline]
pub(crate) fn arch_irq_save() -> usize {
    #[cfg(target_arch = "arm")]
    {
        arch::cpu::irq_save()
    }
    #[cfg(not(target_arch = "arm"))]
    {
        0
    }
}

#[inline]
pub(crate) fn arch_irq_restore(state: usize) {
    #[cfg(target_arch = "arm")]
    arch::cpu::irq_restore(state);
    #[cfg(not(target_arch = "arm"))]
    let _ = state;
}

#[inline]
pub(crate) fn arch_cpu_idle() {
    #[cfg(target_arch = "arm")]
    arch::cpu::idle();
    #[cfg(not(target_arch = "arm"))]
    core::hint::spin_loop();
}

#[inline]
pub(crate) fn arch_reset() {
    #[cfg(target_arch = "arm")]
    arch::cpu::reset();
}

#[inline]
pub(crate) fn arch_set_current_regs(ptr: *mut u32) {
    #[cfg(target_arch = "arm")]
    arch::cpu::set_current_regs(ptr);
    #[cfg(not(target_arch = "arm"))]
    let _ = ptr;
}

/// Polled early-boot output, before the console is bound.
#[doc(hidden)]
pub fn _early_print(args: core::fmt::Arguments) {
    #[cfg(target_arch = "arm")]
    {
        use core::fmt::Write;
        struct W;
        impl core::fmt::Write for W {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                arch::uart::poll_write(s.as_bytes());
                Ok(())
            }
        }
        let _ = W.write_fmt(args);
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = args;
}

#[macro_export]
macro_rules! early_println {
    () => ($crate::_early_print(format_args!("\r\n")));
    ($fmt:expr) => ($crate::_early_print(format_args!(concat!($fmt, "\r\n"))));
    ($fmt:expr, $($arg:tt)*) => ($crate::_early_print(
        format_args!(concat!($fmt, "\r\n"), $($arg)*)));
}

// ── Kernel entry ────────────────────────────────────────────────────────────

/// Blink the red LED once a second. The canary task: if the light stops,
/// scheduling stopped.
#[cfg(all(target_arch = "arm", not(test)))]
fn red_task() {
    arch::regs::led_clear(arch::regs::LED_RED);
    loop {
        syscall::user::sleep(1000);
        arch::regs::led_toggle(arch::regs::LED_RED);
    }
}

/// Main kernel entry, called from the startup code with interrupts
/// disabled.
#[cfg(all(target_arch = "arm", not(test)))]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    // Memory first: arch and sched both allocate.
    kalloc::mem_init();
    arch::init::arch_init();
    if sched::sched_init().is_err() {
        fault::fatal("sched_init: failed to create idle task");
    }

    // Core is consistent; let the world in.
    arch::cpu::irq_enable();

    kprintln!();
    kprintln!("*** emberOS ***");
    kprintln!("core arch and interrupts online");
    kprintln!("heap: {:#x} bytes in use", kalloc::heap_used());

    #[cfg(feature = "net")]
    {
        if eth::eth_init().is_err() {
            kprintln!("net: failed to start link-layer tasks");
        }
        arch::eth::init();
    }

    match sched::spawn(red_task, "red", sched::TaskMode::System) {
        Ok(id) => kprintln!("spawned red task: slot {}", id),
        Err(_) => kprintln!("failed to spawn red task"),
    }

    // Initial tasks are ready; from here the tick drives everything.
    sched::enable_scheduler();

    loop {
        // Reached only briefly: the first tick switches away, and the
        // idle task owns this loop's job from then on.
        arch_cpu_idle();
    }
}

/// Panic: dump to the polled UART and halt. The kernel has no one to
/// unwind to.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    let _ = arch_irq_save();
    early_println!();
    early_println!("!!! KERNEL PANIC !!!");
    early_println!("{}", info);
    loop {
        arch_cpu_idle();
    }
}

// ── Test support ────────────────────────────────────────────────────────────
