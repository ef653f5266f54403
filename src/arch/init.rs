//! Board bring-up: traps, interrupt controllers, tick timer, console.

use crate::arch::{cpu, timer, uart, vic};
use crate::cons;
use crate::uart::Uart;

/// Low-level init: controllers quiesced, vector table installed, tick
/// running, console UART bound. Interrupts stay globally masked until the
/// caller enables them.
pub fn arch_init() {
    vic::init();
    cpu::init_traps();

    timer::init();

    let mut uart1 = Uart::new(&uart::UART1_OPS);
    let ops = uart1.ops;
    if ops.open(&mut uart1).is_ok() {
        cons::cons_init(uart1);
    }
}
