//! Build-time kernel configuration.
//!
//! Everything here is a plain constant so the values show up in one place
//! instead of being scattered through the subsystems. Board variants that
//! need different values get a cargo feature, not a runtime knob.

/// Periodic timer rate. One tick is 10 ms.
pub const HZ: u32 = 100;

/// Per-task stack size. Stacks grow down from the top of the allocation.
pub const TASK_STACK_SIZE: usize = 4096;

/// Per-task formatted-output line buffer.
pub const STDOUT_SIZE: usize = 1024;

/// UART software FIFO depth (each direction).
pub const UART_FIFO_SIZE: usize = 1024;

/// Default console line rate (8N1).
pub const CONSOLE_BAUD: u32 = 115_200;

/// Waiter capacity for the console read completion.
pub const CONS_WAITERS: usize = 10;

// ── Heap geometry ───────────────────────────────────────────────────────────

/// Total statically-placed heap. Must cover the bump tier plus the slab
/// carve-out below.
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Smallest slab chunk size.
pub const ALLOC_MIN: usize = 32;

/// Number of size classes, doubling from `ALLOC_MIN`: 32 B .. 8 KiB.
pub const ALLOC_STEPS: usize = 9;

/// Chunks carved per size class at slab init.
pub const ALLOC_NUM: usize = 128;

// ── Ethernet ────────────────────────────────────────────────────────────────

/// Receive descriptor ring length. The status ring matches.
pub const ETH_RX_RING: usize = 64;

/// Transmit descriptor ring length. The status ring matches.
pub const ETH_TX_RING: usize = 64;

/// Per-descriptor DMA buffer: max frame (1518) rounded up for alignment.
pub const ETH_BUF_SIZE: usize = 1520;

/// Waiter capacity for the receive-path completion. Only the RX task parks
/// on it.
pub const ETH_RX_WAITERS: usize = 1;

/// Transmit pacing interval for the TX drain task, in milliseconds.
pub const ETH_TX_PACE_MS: u32 = 100;

/// Event bit used to kick the TX drain task ahead of its pacing interval.
pub const EV_ETH_TX: u32 = 0x0000_0001;

// ── Static network configuration ────────────────────────────────────────────
// The board has no configuration store; address and route are compiled in,
// the same way the console baud rate is.

/// Interface address, host byte order (192.168.0.99).
pub const BOARD_IP: u32 = (192 << 24) | (168 << 16) | 99;

/// Directly attached network (192.168.0.0/24).
pub const BOARD_NET: u32 = (192 << 24) | (168 << 16);
pub const BOARD_NETMASK: u32 = 0xFFFF_FF00;
