//! Console UART driver.
//!
//! Implements the device half of [`crate::uart`] for the on-chip AMBA
//! UART: rate and frame programming, interrupt-driven FIFO service in
//! both directions, and a polled transmit path for output before (or
//! instead of) the interrupt machinery.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use crate::arch::regs::{self, UART_CTRL, UART_FLAG, UART_INT, UART_LCRH};
use crate::config::CONSOLE_BAUD;
use crate::uart::{Uart, UartError, UartOps, UartState};

/// Input clock for the baud divisor.
const FUARTCLK: u32 = 7_372_800;

pub struct Ep93xxUartOps;

/// The console device operations, shared by the `Uart` object and the
/// ISR.
pub static UART1_OPS: Ep93xxUartOps = Ep93xxUartOps;

fn uart1_isr() {
    let id = regs::uart1().int_id_clr.get();

    if id & (1 << UART_INT::RIS.shift) != 0 {
        crate::cons::rx_isr();
    }
    if id & (1 << UART_INT::TIS.shift) != 0 {
        crate::cons::tx_isr();
    }
}

impl UartOps for Ep93xxUartOps {
    fn open(&self, uart: &mut Uart) -> Result<(), UartError> {
        uart.rx_fifo.clear();
        uart.tx_fifo.clear();

        self.set_baud(uart, CONSOLE_BAUD)?;

        let u = regs::uart1();
        // 8N1, FIFOs off: the software rings do the buffering.
        u.lin_ctrl_high.write(UART_LCRH::WLEN.val(0b11));

        if crate::irq::register_irq(regs::INT_UART1, uart1_isr).is_err() {
            return Err(UartError::OpenFailed);
        }

        u.ctrl
            .write(UART_CTRL::UARTE::SET + UART_CTRL::RIE::SET + UART_CTRL::TIE::SET);
        crate::irq::enable_irq(regs::INT_UART1);

        uart.state = UartState::Open;
        Ok(())
    }

    fn close(&self, uart: &mut Uart) {
        let u = regs::uart1();
        u.ctrl.set(u.ctrl.get() & !1); // UARTE off
        uart.rx_fifo.clear();
        uart.tx_fifo.clear();
        uart.state = UartState::Closed;
    }

    fn set_baud(&self, uart: &mut Uart, baud: u32) -> Result<(), UartError> {
        if baud == 0 {
            return Err(UartError::BadBaud);
        }
        let divisor = FUARTCLK / (16 * baud) - 1;

        let u = regs::uart1();
        u.lin_ctrl_low.set(divisor & 0xFF);
        u.lin_ctrl_med.set((divisor >> 8) & 0xFF);
        // The high register must be written last to latch the divisor.
        u.lin_ctrl_high.write(UART_LCRH::WLEN.val(0b11));

        uart.baud = baud;
        Ok(())
    }

    fn disable_tx(&self) {
        let u = regs::uart1();
        u.ctrl.modify(UART_CTRL::TIE::CLEAR);
    }

    fn enable_tx(&self) {
        let u = regs::uart1();
        u.ctrl.modify(UART_CTRL::TIE::SET);
    }

    fn disable_rx(&self) {
        let u = regs::uart1();
        u.ctrl.modify(UART_CTRL::RIE::CLEAR);
    }

    fn enable_rx(&self) {
        let u = regs::uart1();
        u.ctrl.modify(UART_CTRL::RIE::SET);
    }

    fn rx(&self, uart: &mut Uart) {
        let u = regs::uart1();
        while !u.flag.is_set(UART_FLAG::RXFE) && uart.rx_fifo.free() > 0 {
            uart.rx_fifo.push(u.data.get() as u8);
        }
    }

    fn tx(&self, uart: &mut Uart) {
        let u = regs::uart1();

        // Nothing staged: quiesce the TX interrupt.
        if uart.tx_fifo.is_empty() {
            self.disable_tx();
            return;
        }

        while !u.flag.is_set(UART_FLAG::TXFF) {
            match uart.tx_fifo.pop() {
                Some(c) => u.data.set(c as u32),
                None => break,
            }
        }
    }
}

/// Busy-wait transmit for output before the console is bound (early boot
/// diagnostics, fatal paths).
pub fn poll_write(buf: &[u8]) {
    let u = regs::uart1();
    for &c in buf {
        while u.flag.is_set(UART_FLAG::TXFF) {}
        u.data.set(c as u32);
    }
}
