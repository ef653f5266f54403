//! Periodic tick source.
//!
//! Timer3 reloads at 100 Hz off the 508 kHz clock. The ISR clears the
//! hardware interrupt, advances kernel time and blinks the green
//! heartbeat LED once per second of ticks accumulated.

use tock_registers::interfaces::Writeable;

use crate::arch::regs::{self, TIMER_CTRL, TIMER3_LOAD_100HZ};
use crate::config::HZ;

/// Heartbeat period in timer interrupts.
const HEARTBEAT_TICKS: u32 = HZ / 10;

static mut HEARTBEAT: u32 = 0;

fn timer_isr() {
    let t3 = regs::timer3();
    t3.clear.set(0);

    crate::time::timer_int();

    // SAFETY: only this ISR touches the counter, and it cannot nest.
    unsafe {
        HEARTBEAT += 1;
        if HEARTBEAT >= HEARTBEAT_TICKS {
            HEARTBEAT = 0;
            regs::led_toggle(regs::LED_GREEN);
        }
    }
}

/// Program Timer3 for the kernel tick and hook its interrupt.
pub fn init() {
    if crate::irq::register_irq(regs::TC3OI, timer_isr).is_err() {
        crate::kprintln!("timer: failed to register tick handler");
        return;
    }
    crate::irq::enable_irq(regs::TC3OI);

    let t3 = regs::timer3();
    t3.load.set(TIMER3_LOAD_100HZ);
    t3.control
        .write(TIMER_CTRL::ENABLE::SET + TIMER_CTRL::MODE::Periodic + TIMER_CTRL::CLKSEL::Clk508k);
}
