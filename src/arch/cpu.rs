//! CPU mode plumbing: startup, trap entries, context save/restore and the
//! small primitives (interrupt masking, idle, reset) the portable kernel
//! calls through the crate-root shims.
//!
//! The saved-context layout is the scheduler's `RegisterFile`:
//! `[spsr, return-pc, r0-r12, sp, lr]`, seventeen words. `CUR_REGS` points
//! at the current task's file; every trap saves into it and the common
//! restore path reloads from it, so a `schedule()` between the two is all
//! a context switch takes.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::regs::VECTOR_BASE;

/// Written by the scheduler on every switch; read by the trap asm.
#[no_mangle]
pub static CUR_REGS: AtomicUsize = AtomicUsize::new(0);

pub fn set_current_regs(ptr: *mut u32) {
    CUR_REGS.store(ptr as usize, Ordering::SeqCst);
}

/// Mask IRQs, returning the previous CPSR for [`irq_restore`].
pub fn irq_save() -> usize {
    let cpsr: u32;
    unsafe {
        asm!(
            "mrs {0}, cpsr",
            "orr {1}, {0}, #0x80",
            "msr cpsr_c, {1}",
            out(reg) cpsr,
            out(reg) _,
            options(nostack),
        );
    }
    cpsr as usize
}

pub fn irq_restore(state: usize) {
    unsafe {
        asm!(
            "msr cpsr_c, {0}",
            in(reg) state as u32,
            options(nostack),
        );
    }
}

pub fn irq_enable() {
    unsafe {
        asm!(
            "mrs {0}, cpsr",
            "bic {0}, {0}, #0x80",
            "msr cpsr_c, {0}",
            out(reg) _,
            options(nostack),
        );
    }
}

/// Low-power wait until the next interrupt.
pub fn idle() {
    unsafe {
        asm!("mcr p15, 0, {0}, c7, c0, 4", in(reg) 0u32, options(nostack));
    }
}

/// Hard reset: interrupts off, jump through the reset vector.
pub fn reset() -> ! {
    let _ = irq_save();
    unsafe {
        asm!("mov pc, #0", options(noreturn));
    }
}

/// `ldr pc, [pc, #0x18]`: primary vector slots jump through the secondary
/// table that follows them.
const LDR_PC_PC: u32 = 0xE59F_F000 | 0x18;

extern "C" {
    pub fn arm_reset_entry();
    pub fn arm_und_entry();
    pub fn arm_svc_entry();
    pub fn arm_pa_entry();
    pub fn arm_da_entry();
    pub fn arm_irq_entry();
}

/// Install the CPU vector table: eight jump instructions, then the
/// secondary table of handler addresses they load through.
pub fn init_traps() {
    // SAFETY: the vector page is ours alone and identity-mapped.
    unsafe {
        let vec = VECTOR_BASE as *mut u32;

        for i in 0..8 {
            vec.add(i).write_volatile(LDR_PC_PC);
        }
        vec.add(5).write_volatile(0); // reserved slot

        vec.add(8).write_volatile(arm_reset_entry as usize as u32);
        vec.add(9).write_volatile(arm_und_entry as usize as u32);
        vec.add(10).write_volatile(arm_svc_entry as usize as u32);
        vec.add(11).write_volatile(arm_pa_entry as usize as u32);
        vec.add(12).write_volatile(arm_da_entry as usize as u32);
        vec.add(13).write_volatile(0);
        vec.add(14).write_volatile(arm_irq_entry as usize as u32);
    }
}

// ── Trap entries ────────────────────────────────────────────────────────────
//
// Saving order matters: spsr and the adjusted return address go in first
// with two registers parked on the mode stack, then the parked pair, then
// r2-r12, then the banked user sp/lr.

global_asm!(
    r#"
    .section .text
    .global _start
    .global arm_reset_entry
    .global arm_irq_entry
    .global arm_svc_entry
    .global arm_da_entry
    .global arm_pa_entry
    .global arm_und_entry

_start:
arm_reset_entry:
    /* Mode stacks; IRQs and FIQs stay off until bring-up finishes. */
    msr     cpsr_c, #0xD2           /* IRQ mode */
    ldr     sp, =__irq_stack_top
    msr     cpsr_c, #0xD7           /* abort mode */
    ldr     sp, =__abt_stack_top
    msr     cpsr_c, #0xDB           /* undefined mode */
    ldr     sp, =__und_stack_top
    msr     cpsr_c, #0xD3           /* SVC mode */
    ldr     sp, =__svc_stack_top

    /* Clear .bss */
    ldr     r0, =__bss_start__
    ldr     r1, =__bss_end__
    mov     r2, #0
1:  cmp     r0, r1
    strlo   r2, [r0], #4
    blo     1b

    bl      kmain
2:  b       2b

/* Save the interrupted context into *CUR_REGS. On entry two scratch
   registers are parked on the mode stack and lr already holds the
   adjusted return address. */
.macro save_context
    ldr     r0, =CUR_REGS
    ldr     r0, [r0]
    mrs     r1, spsr
    str     r1, [r0], #4            /* regs[0] = spsr */
    str     lr, [r0], #4            /* regs[1] = return pc */
    ldmfd   sp!, {{r1, lr}}         /* original r0, r1 */
    stmia   r0!, {{r1, lr}}         /* regs[2], regs[3] */
    stmia   r0!, {{r2-r12}}         /* regs[4..14] */
    stmia   r0, {{sp, lr}}^         /* regs[15], regs[16] = user sp, lr */
.endm

arm_irq_entry:
    sub     lr, lr, #4
    stmfd   sp!, {{r0, r1}}
    save_context
    bl      irq_rust_entry
    b       arm_context_restore

arm_svc_entry:
    stmfd   sp!, {{r0, r1}}
    save_context
    /* Saved r0/r1 carry the syscall number and argument. */
    ldr     r2, =CUR_REGS
    ldr     r2, [r2]
    ldr     r0, [r2, #8]
    ldr     r1, [r2, #12]
    bl      svc_rust_entry
    b       arm_context_restore

arm_da_entry:
    sub     lr, lr, #8
    stmfd   sp!, {{r0, r1}}
    save_context
    mrc     p15, 0, r0, c6, c0, 0   /* fault address */
    mrc     p15, 0, r1, c5, c0, 0   /* fault status */
    bl      da_rust_entry
    b       arm_context_restore

arm_pa_entry:
    sub     lr, lr, #4
    stmfd   sp!, {{r0, r1}}
    save_context
    bl      pa_rust_entry
    b       arm_context_restore

arm_und_entry:
    sub     lr, lr, #4
    stmfd   sp!, {{r0, r1}}
    save_context
    bl      und_rust_entry
    b       arm_context_restore

/* Reload the (possibly different) current context and return to it. */
arm_context_restore:
    ldr     r0, =CUR_REGS
    ldr     r0, [r0]
    ldr     r1, [r0, #0]
    msr     spsr_cxsf, r1
    add     r1, r0, #60
    ldmia   r1, {{sp, lr}}^         /* user sp, lr */
    nop
    ldr     lr, [r0, #4]            /* return pc */
    add     r0, r0, #8
    ldmia   r0, {{r0-r12}}
    movs    pc, lr

    .section .bss
    .align  3
__svc_stack:
    .skip   4096
__svc_stack_top:
__irq_stack:
    .skip   1024
__irq_stack_top:
__abt_stack:
    .skip   1024
__abt_stack_top:
__und_stack:
    .skip   1024
__und_stack_top:
"#
);

// ── Rust halves of the trap entries ─────────────────────────────────────────

#[no_mangle]
extern "C" fn irq_rust_entry() {
    let prev = crate::stdio::enter_kernel_self();
    crate::arch::vic::dispatch_active();
    crate::stdio::leave_kernel_self(prev);

    if crate::sched::take_resched() {
        crate::sched::schedule();
    }
}

#[no_mangle]
extern "C" fn svc_rust_entry(num: u32, arg: u32) {
    let prev = crate::stdio::enter_kernel_self();
    let rc = crate::syscall::dispatch(num as usize, arg as usize);
    crate::sched::set_current_return(rc);
    crate::stdio::leave_kernel_self(prev);

    if crate::sched::take_resched() {
        crate::sched::schedule();
    }
}

fn saved_spsr() -> u32 {
    let p = CUR_REGS.load(Ordering::SeqCst) as *const u32;
    if p.is_null() {
        0
    } else {
        // SAFETY: CUR_REGS always points at a live register file once the
        // scheduler is up.
        unsafe { p.read() }
    }
}

fn from_user_mode() -> bool {
    saved_spsr() & 0x1F == 0x10
}

#[no_mangle]
extern "C" fn da_rust_entry(addr: u32, fsr: u32) {
    let prev = crate::stdio::enter_kernel_self();
    crate::fault::data_abort(addr, fsr, from_user_mode());
    crate::stdio::leave_kernel_self(prev);

    crate::sched::take_resched();
    crate::sched::schedule();
}

#[no_mangle]
extern "C" fn pa_rust_entry() {
    let prev = crate::stdio::enter_kernel_self();
    crate::kprintln!(
        "pid {:#x}: prefetch abort, killing task",
        crate::sched::current_pid()
    );
    crate::sched::kill_current();
    crate::stdio::leave_kernel_self(prev);

    crate::sched::take_resched();
    crate::sched::schedule();
}

#[no_mangle]
extern "C" fn und_rust_entry() {
    let prev = crate::stdio::enter_kernel_self();
    crate::kprintln!(
        "pid {:#x}: undefined instruction, killing task",
        crate::sched::current_pid()
    );
    crate::sched::kill_current();
    crate::stdio::leave_kernel_self(prev);

    crate::sched::take_resched();
    crate::sched::schedule();
}
