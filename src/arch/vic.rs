//! PL190-style vectored interrupt controller pair.
//!
//! The portable dispatch table in [`crate::irq`] owns slot assignment;
//! this module mirrors it into the controllers and walks the active
//! vector registers at interrupt time.

use tock_registers::interfaces::{Readable, Writeable};

use crate::arch::cpu::arm_irq_entry;
use crate::arch::regs::{self, VicRegs, VECT_CNTL_ENABLE};

fn controller_for(line: u32) -> (&'static VicRegs, u32) {
    if line < 32 {
        (regs::vic1(), line)
    } else {
        (regs::vic2(), line - 32)
    }
}

/// Quiesce both controllers and point every vector at the IRQ entry
/// trampoline so a spurious interrupt still lands somewhere accountable.
pub fn init() {
    for vic in [regs::vic1(), regs::vic2()] {
        vic.int_select.set(0);
        vic.int_en_clear.set(0xFFFF_FFFF);
        vic.itcr.set(0);
        vic.soft_int_clear.set(0xFFFF_FFFF);
    }

    // Drain anything pending from before the kernel took over.
    for _ in 0..32 {
        let _ = regs::vic1().vect_addr.get();
        regs::vic1().vect_addr.set(0);
        let _ = regs::vic2().vect_addr.get();
        regs::vic2().vect_addr.set(0);
    }

    for vic in [regs::vic1(), regs::vic2()] {
        for i in 0..16 {
            vic.vect_cntls[i].set(0);
            vic.vect_addrs[i].set(0);
        }
        vic.vect_addr.set(arm_irq_entry as usize as u32);
        vic.def_vect_addr.set(arm_irq_entry as usize as u32);
    }
}

/// Mirror a claimed dispatch-table slot into the controller.
pub fn program_slot(line: u32, slot: usize, handler: fn()) {
    let (vic, local) = controller_for(line);

    // The line is a plain IRQ, not FIQ.
    vic.int_select.set(vic.int_select.get() & !(1 << local));

    vic.vect_addrs[slot].set(handler as usize as u32);
    vic.vect_cntls[slot].set(local | VECT_CNTL_ENABLE);
}

pub fn enable_line(line: u32) {
    let (vic, local) = controller_for(line);
    vic.int_enable.set(vic.int_enable.get() | (1 << local));
}

fn service(vic: &'static VicRegs) {
    let addr = vic.vect_addr.get();

    if addr == arm_irq_entry as usize as u32 {
        // The controller handed back the entry trampoline itself; count
        // it rather than re-entering.
        crate::irq::note_recursion();
    } else if addr != 0 {
        // SAFETY: only `program_slot` writes vector addresses, and it
        // writes registered handler functions.
        let handler: fn() = unsafe { core::mem::transmute(addr as usize) };
        handler();
    }

    // Acknowledge: priority hardware unwinds to the next pending vector.
    vic.vect_addr.set(0);
}

/// Service whatever each controller has active. Called from the IRQ
/// trampoline with interrupts masked.
pub fn dispatch_active() {
    service(regs::vic1());
    service(regs::vic2());
}
