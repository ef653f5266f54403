//! Console binding.
//!
//! One UART is designated the system console at bring-up. Writes are
//! non-blocking at the ring level but loop until everything is staged;
//! blocking reads park on the console completion, which the RX interrupt
//! wakes.

use lazy_static::lazy_static;

use crate::config::CONS_WAITERS;
use crate::sync::{Completion, IrqMutex};
use crate::uart::Uart;

static CONSOLE: IrqMutex<Option<Uart>> = IrqMutex::new(None);

lazy_static! {
    /// Readers parked waiting for input.
    static ref RX_WAIT: Completion = Completion::new(CONS_WAITERS);
}

/// Bind `uart` as the console. The device is expected to be open.
pub fn cons_init(uart: Uart) {
    *CONSOLE.lock() = Some(uart);
}

/// Non-blocking read of whatever input is pending. -1 without a console.
pub fn read(buf: &mut [u8]) -> i32 {
    let mut c = CONSOLE.lock();
    match c.as_mut() {
        Some(uart) => uart.read(buf) as i32,
        None => -1,
    }
}

/// Read at least one byte, parking until input arrives.
pub fn read_blocking(buf: &mut [u8]) -> i32 {
    loop {
        let n = read(buf);
        if n != 0 {
            return n;
        }
        if crate::syscall::user::wait(&RX_WAIT) < 0 {
            return -1;
        }
    }
}

/// Write the whole buffer, looping while the TX ring drains. -1 without a
/// console.
pub fn write(buf: &[u8]) -> i32 {
    let mut n = 0usize;
    while n < buf.len() {
        let rc = {
            let mut c = CONSOLE.lock();
            match c.as_mut() {
                Some(uart) => uart.write(&buf[n..]),
                None => return -1,
            }
        };
        n += rc;
        if rc == 0 {
            // Ring full: spin until the TX interrupt makes room. The wait
            // is bounded by the UART draining at line rate.
            core::hint::spin_loop();
        }
    }
    n as i32
}

/// RX interrupt half: pull bytes in, wake any parked readers.
pub fn rx_isr() {
    let mut c = CONSOLE.lock();
    if let Some(uart) = c.as_mut() {
        let ops = uart.ops;
        ops.rx(uart);
    }
    drop(c);
    crate::sched::wake_all(&RX_WAIT);
}

/// TX interrupt half: push staged bytes out.
pub fn tx_isr() {
    let mut c = CONSOLE.lock();
    if let Some(uart) = c.as_mut() {
        let ops = uart.ops;
        ops.tx(uart);
    }
}
