//! Per-task buffered console output.
//!
//! Each task owns a line buffer in its self block; `putchar` appends and
//! flushes on newline or when the buffer fills. Interactive code (line
//! editing) turns buffering off around a read and restores it afterwards.
//!
//! The `kprint!`/`kprintln!` macros format through `core::fmt` into this
//! path, so everything a task prints goes out through its own buffer and
//! the console UART.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::STDOUT_SIZE;

/// Task-local state visible to the stdio layer. Interrupt and syscall
/// entries swap the installed block for the kernel's own so handler output
/// never interleaves with the interrupted task's buffer.
pub struct SelfBlock {
    out: Vec<u8>,
    idx: usize,
    buf_enable: bool,
    buf_last: bool,
}

impl SelfBlock {
    pub fn new() -> Option<SelfBlock> {
        let mut out = Vec::new();
        out.try_reserve_exact(STDOUT_SIZE).ok()?;
        out.resize(STDOUT_SIZE, 0u8);
        Some(SelfBlock {
            out,
            idx: 0,
            buf_enable: true,
            buf_last: true,
        })
    }

    fn flush(&mut self) {
        if self.idx > 0 {
            let _ = crate::cons::write(&self.out[..self.idx]);
            self.idx = 0;
        }
    }

    fn putc(&mut self, c: u8) {
        if self.buf_enable {
            if self.idx >= STDOUT_SIZE {
                self.flush();
            }
            self.out[self.idx] = c;
            self.idx += 1;
            if c == b'\n' {
                self.flush();
            }
        } else {
            let _ = crate::cons::write(&[c]);
        }
    }

    pub fn buf_disable(&mut self) {
        self.buf_last = self.buf_enable;
        self.buf_enable = false;
    }

    pub fn buf_enable(&mut self) {
        self.buf_last = self.buf_enable;
        self.buf_enable = true;
    }

    pub fn buf_restore(&mut self) {
        self.buf_enable = self.buf_last;
    }
}

// ── Current self block ──────────────────────────────────────────────────────

/// Pointer to the self block of whatever context is executing. Written only
/// by the scheduler's switch path and the kernel-entry swaps.
static CURRENT_SELF: AtomicUsize = AtomicUsize::new(0);

/// Self block used while servicing interrupts and syscalls.
static KERNEL_SELF: spin::Mutex<Option<Box<SelfBlock>>> = spin::Mutex::new(None);

pub fn install_self(ptr: *mut SelfBlock) {
    CURRENT_SELF.store(ptr as usize, Ordering::SeqCst);
}

pub fn clear_self() {
    CURRENT_SELF.store(0, Ordering::SeqCst);
}

/// Set up the kernel's own self block. Called once from `sched_init`.
pub fn init_kernel_self() {
    let mut ks = KERNEL_SELF.lock();
    if ks.is_none() {
        *ks = SelfBlock::new().map(Box::new);
    }
}

pub fn kernel_self_ptr() -> *mut SelfBlock {
    match KERNEL_SELF.lock().as_mut() {
        Some(b) => &mut **b as *mut SelfBlock,
        None => core::ptr::null_mut(),
    }
}

/// Swap to the kernel self block on kernel entry; returns the previous
/// pointer for the matching [`leave_kernel_self`].
pub fn enter_kernel_self() -> usize {
    CURRENT_SELF.swap(kernel_self_ptr() as usize, Ordering::SeqCst)
}

pub fn leave_kernel_self(prev: usize) {
    CURRENT_SELF.store(prev, Ordering::SeqCst);
}

fn with_self<R>(f: impl FnOnce(&mut SelfBlock) -> R) -> Option<R> {
    // Mask interrupts so a handler cannot swap the block mid-write.
    let irq = crate::arch_irq_save();
    let ptr = CURRENT_SELF.load(Ordering::SeqCst) as *mut SelfBlock;
    let r = if ptr.is_null() {
        None
    } else {
        // SAFETY: the pointer targets the self block of the live current
        // task (or the kernel block); tasks are never destroyed while
        // current, and interrupts are off.
        Some(f(unsafe { &mut *ptr }))
    };
    crate::arch_irq_restore(irq);
    r
}

pub fn putchar(c: u8) {
    if with_self(|s| s.putc(c)).is_none() {
        // No task context yet: straight to the console.
        let _ = crate::cons::write(&[c]);
    }
}

pub fn puts(s: &str) {
    for &b in s.as_bytes() {
        putchar(b);
    }
    putchar(b'\r');
    putchar(b'\n');
}

pub fn stdio_buf_disable() {
    with_self(|s| s.buf_disable());
}

pub fn stdio_buf_enable() {
    with_self(|s| s.buf_enable());
}

pub fn stdio_buf_restore() {
    with_self(|s| s.buf_restore());
}

struct StdoutWriter;

impl fmt::Write for StdoutWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            putchar(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = StdoutWriter.write_fmt(args);
}

/// Print through the current task's line buffer (no newline).
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::stdio::_print(format_args!($($arg)*))
    };
}

/// Print through the current task's line buffer with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($fmt:expr) => ($crate::kprint!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::kprint!(
        concat!($fmt, "\n"), $($arg)*));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_until_newline() {
        let mut s = SelfBlock::new().unwrap();
        s.putc(b'h');
        s.putc(b'i');
        assert_eq!(s.idx, 2);
        s.putc(b'\n');
        // Newline flushed the buffer.
        assert_eq!(s.idx, 0);
    }

    #[test]
    fn flushes_when_full() {
        let mut s = SelfBlock::new().unwrap();
        for _ in 0..STDOUT_SIZE {
            s.putc(b'x');
        }
        assert_eq!(s.idx, STDOUT_SIZE);
        // The next character forces a flush first.
        s.putc(b'y');
        assert_eq!(s.idx, 1);
    }

    #[test]
    fn disable_restore_round_trip() {
        let mut s = SelfBlock::new().unwrap();
        assert!(s.buf_enable);
        s.buf_disable();
        assert!(!s.buf_enable);
        s.buf_restore();
        assert!(s.buf_enable);

        // Unbuffered writes bypass the line buffer entirely.
        s.buf_disable();
        s.putc(b'z');
        assert_eq!(s.idx, 0);
        s.buf_restore();
    }
}
