//! Memory-mapped peripheral blocks.
//!
//! Typed views over the SoC register file. The base addresses follow the
//! standard EP93xx layout with everything hanging off 0x8000_0000.

use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

pub const REG_BASE: usize = 0x8000_0000;

/// CPU vector table location. The loader leaves the MMU off by default,
/// so the table sits at physical zero; boards running with the remapped
/// high vector page select the alternative base.
#[cfg(feature = "high-vectors")]
pub const VECTOR_BASE: usize = 0xFFE0_0000;
#[cfg(not(feature = "high-vectors"))]
pub const VECTOR_BASE: usize = 0;

pub const ETH_BASE: usize = REG_BASE + 0x0001_0000;
pub const VIC1_BASE: usize = REG_BASE + 0x000B_0000;
pub const VIC2_BASE: usize = REG_BASE + 0x000C_0000;
pub const TIMER_BASE: usize = REG_BASE + 0x0081_0000;
pub const GPIO_BASE: usize = REG_BASE + 0x0084_0000;
pub const UART1_BASE: usize = REG_BASE + 0x008C_0000;

/// Timer3 lives at this offset inside the timer block.
pub const TIMER3_BASE: usize = TIMER_BASE + 0x80;

/// Port E data register drives the two board LEDs.
pub const PEDR: usize = GPIO_BASE + 0x20;

pub const LED_GREEN: u8 = 0x01;
pub const LED_RED: u8 = 0x02;

// ── Interrupt lines ─────────────────────────────────────────────────────────

/// Ethernet MAC interrupt.
pub const INT_MAC: u32 = 39;
/// Timer3 overflow interrupt.
pub const TC3OI: u32 = 51;
/// Console UART interrupt.
pub const INT_UART1: u32 = 52;

/// Vector control word: line number plus the slot enable bit.
pub const VECT_CNTL_ENABLE: u32 = 1 << 5;

register_structs! {
    /// One PL190-style vectored interrupt controller.
    pub VicRegs {
        (0x000 => pub irq_status: ReadOnly<u32>),
        (0x004 => pub fiq_status: ReadOnly<u32>),
        (0x008 => pub raw_intr: ReadOnly<u32>),
        (0x00C => pub int_select: ReadWrite<u32>),
        (0x010 => pub int_enable: ReadWrite<u32>),
        (0x014 => pub int_en_clear: WriteOnly<u32>),
        (0x018 => pub soft_int: ReadWrite<u32>),
        (0x01C => pub soft_int_clear: WriteOnly<u32>),
        (0x020 => pub protection: ReadWrite<u32>),
        (0x024 => _reserved0),
        (0x030 => pub vect_addr: ReadWrite<u32>),
        (0x034 => pub def_vect_addr: ReadWrite<u32>),
        (0x038 => _reserved1),
        (0x100 => pub vect_addrs: [ReadWrite<u32>; 16]),
        (0x140 => _reserved2),
        (0x200 => pub vect_cntls: [ReadWrite<u32>; 16]),
        (0x240 => _reserved3),
        (0x300 => pub itcr: ReadWrite<u32>),
        (0x304 => @END),
    }
}

register_structs! {
    /// Timer3: 32-bit down-counter with periodic reload.
    pub Timer3Regs {
        (0x00 => pub load: ReadWrite<u32>),
        (0x04 => pub value: ReadOnly<u32>),
        (0x08 => pub control: ReadWrite<u32, TIMER_CTRL::Register>),
        (0x0C => pub clear: WriteOnly<u32>),
        (0x10 => @END),
    }
}

register_bitfields! [u32,
    pub TIMER_CTRL [
        ENABLE OFFSET(7) NUMBITS(1) [],
        MODE OFFSET(6) NUMBITS(1) [
            FreeRunning = 0,
            Periodic = 1
        ],
        CLKSEL OFFSET(3) NUMBITS(1) [
            /// 508 kHz input clock.
            Clk508k = 1
        ]
    ]
];

/// Timer3 reload for a 100 Hz tick off the 508 kHz clock.
pub const TIMER3_LOAD_100HZ: u32 = 5080;

register_structs! {
    /// AMBA-style UART.
    pub UartRegs {
        (0x00 => pub data: ReadWrite<u32>),
        (0x04 => pub rx_sts: ReadWrite<u32>),
        (0x08 => pub lin_ctrl_high: ReadWrite<u32, UART_LCRH::Register>),
        (0x0C => pub lin_ctrl_med: ReadWrite<u32>),
        (0x10 => pub lin_ctrl_low: ReadWrite<u32>),
        (0x14 => pub ctrl: ReadWrite<u32, UART_CTRL::Register>),
        (0x18 => pub flag: ReadOnly<u32, UART_FLAG::Register>),
        (0x1C => pub int_id_clr: ReadWrite<u32, UART_INT::Register>),
        (0x20 => @END),
    }
}

register_bitfields! [u32,
    pub UART_LCRH [
        /// Word length; 0b11 is 8 bits.
        WLEN OFFSET(5) NUMBITS(2) [],
        FEN OFFSET(4) NUMBITS(1) []
    ],
    pub UART_CTRL [
        UARTE OFFSET(0) NUMBITS(1) [],
        RIE OFFSET(4) NUMBITS(1) [],
        TIE OFFSET(5) NUMBITS(1) []
    ],
    pub UART_FLAG [
        /// RX FIFO empty.
        RXFE OFFSET(4) NUMBITS(1) [],
        /// TX FIFO full.
        TXFF OFFSET(5) NUMBITS(1) []
    ],
    pub UART_INT [
        /// RX interrupt pending.
        RIS OFFSET(1) NUMBITS(1) [],
        /// TX interrupt pending.
        TIS OFFSET(2) NUMBITS(1) []
    ]
];

register_structs! {
    /// EP9301 Ethernet MAC.
    pub MacRegs {
        (0x0000 => pub rxctl: ReadWrite<u32, RXCTL::Register>),
        (0x0004 => pub txctl: ReadWrite<u32, TXCTL::Register>),
        (0x0008 => _reserved0),
        (0x0010 => pub miicmd: ReadWrite<u32, MIICMD::Register>),
        (0x0014 => pub miidata: ReadWrite<u32>),
        (0x0018 => pub miists: ReadOnly<u32, MIISTS::Register>),
        (0x001C => _reserved1),
        (0x0020 => pub selfctl: ReadWrite<u32, SELFCTL::Register>),
        (0x0024 => pub inten: ReadWrite<u32, INTEN::Register>),
        (0x0028 => pub intstsp: ReadOnly<u32, INTSTS::Register>),
        (0x002C => pub intstsc: ReadOnly<u32, INTSTS::Register>),
        (0x0030 => _reserved2),
        (0x0050 => pub indad: [ReadWrite<u32>; 2]),
        (0x0058 => _reserved3),
        (0x0064 => pub gintmsk: ReadWrite<u32, GINTMSK::Register>),
        (0x0068 => _reserved4),
        (0x0080 => pub bmctl: ReadWrite<u32, BMCTL::Register>),
        (0x0084 => pub bmsts: ReadOnly<u32, BMSTS::Register>),
        (0x0088 => _reserved5),
        (0x0090 => pub rxdq_badd: ReadWrite<u32>),
        (0x0094 => pub rxdq_blen: ReadWrite<u16>),
        (0x0096 => _reserved6),
        (0x0098 => pub rxd_cur_add: ReadWrite<u32>),
        (0x009C => pub rxd_enq: ReadWrite<u32>),
        (0x00A0 => pub rxstsq_badd: ReadWrite<u32>),
        (0x00A4 => pub rxstsq_blen: ReadWrite<u16>),
        (0x00A6 => _reserved7),
        (0x00A8 => pub rxstsq_cur_add: ReadWrite<u32>),
        (0x00AC => pub rxsts_enq: ReadWrite<u32>),
        (0x00B0 => pub txdq_badd: ReadWrite<u32>),
        (0x00B4 => pub txdq_blen: ReadWrite<u16>),
        (0x00B6 => _reserved8),
        (0x00B8 => pub txdq_cur_add: ReadWrite<u32>),
        (0x00BC => pub txd_enq: ReadWrite<u32>),
        (0x00C0 => pub txstsq_badd: ReadWrite<u32>),
        (0x00C4 => pub txstsq_blen: ReadWrite<u16>),
        (0x00C6 => _reserved9),
        (0x00C8 => pub txstsq_cur_add: ReadWrite<u32>),
        (0x00CC => pub txsts_enq: ReadWrite<u32>),
        (0x00D0 => @END),
    }
}

register_bitfields! [u32,
    pub RXCTL [
        /// Serial RX on.
        SRXON OFFSET(0) NUMBITS(1) [],
        /// Accept broadcast frames.
        BA OFFSET(1) NUMBITS(1) [],
        /// Accept runt frames with good CRC.
        RCRCA OFFSET(2) NUMBITS(1) [],
        /// Promiscuous.
        PA OFFSET(3) NUMBITS(1) [],
        /// Match individual address 0.
        IA0 OFFSET(16) NUMBITS(1) []
    ],
    pub TXCTL [
        /// Serial TX on.
        STXON OFFSET(0) NUMBITS(1) []
    ],
    pub MIICMD [
        REGAD OFFSET(0) NUMBITS(5) [],
        PHYAD OFFSET(5) NUMBITS(5) [],
        WRITE OFFSET(14) NUMBITS(1) [],
        READ OFFSET(15) NUMBITS(1) []
    ],
    pub MIISTS [
        BUSY OFFSET(0) NUMBITS(1) []
    ],
    pub SELFCTL [
        /// Soft reset; self-clearing.
        RESET OFFSET(0) NUMBITS(1) [],
        /// Preamble suppress.
        PSPRS OFFSET(8) NUMBITS(1) [],
        /// MDC clock divisor.
        MDCDIV OFFSET(9) NUMBITS(4) []
    ],
    pub INTEN [
        /// Receive end-of-frame.
        REOFIE OFFSET(0) NUMBITS(1) [],
        /// Receive end-of-buffer.
        REOBIE OFFSET(1) NUMBITS(1) [],
        /// Receive header status.
        RHDRIE OFFSET(3) NUMBITS(1) [],
        /// PHY status change.
        PHYSIE OFFSET(11) NUMBITS(1) []
    ],
    pub INTSTS [
        /// Receive status queue posted.
        RXSQ OFFSET(2) NUMBITS(1) [],
        /// Transmit status queue posted.
        TXSQ OFFSET(3) NUMBITS(1) []
    ],
    pub GINTMSK [
        /// Master interrupt enable.
        INT OFFSET(0) NUMBITS(1) []
    ],
    pub BMCTL [
        /// Enable bus-master receive.
        RXEN OFFSET(0) NUMBITS(1) [],
        /// Enable bus-master transmit.
        TXEN OFFSET(8) NUMBITS(1) []
    ],
    pub BMSTS [
        /// Receive engine active.
        RXACT OFFSET(3) NUMBITS(1) []
    ]
];

// ── MII registers (on the PHY, behind MIICMD/MIIDATA) ───────────────────────

pub const MII_CONTROL: u32 = 0;
pub const MII_STATUS: u32 = 1;
pub const MII_AUTONG_ADV: u32 = 4;

pub const MII_CONTROL_RESET: u16 = 1 << 15;
pub const MII_CONTROL_AUTONEG_EN: u16 = 1 << 12;
pub const MII_CONTROL_RESTART_AUTONEG: u16 = 1 << 9;

pub const MII_STATUS_AUTONEG_DONE: u16 = 1 << 5;
pub const MII_STATUS_LINK: u16 = 1 << 2;

/// 10/100, half/full advertisement over 802.3.
pub const MII_ADV_ALL: u16 = 0x01E1;

// ── Typed access to fixed blocks ────────────────────────────────────────────

pub fn vic1() -> &'static VicRegs {
    // SAFETY: fixed SoC block, never aliased mutably.
    unsafe { &*(VIC1_BASE as *const VicRegs) }
}

pub fn vic2() -> &'static VicRegs {
    // SAFETY: as above.
    unsafe { &*(VIC2_BASE as *const VicRegs) }
}

pub fn timer3() -> &'static Timer3Regs {
    // SAFETY: as above.
    unsafe { &*(TIMER3_BASE as *const Timer3Regs) }
}

pub fn uart1() -> &'static UartRegs {
    // SAFETY: as above.
    unsafe { &*(UART1_BASE as *const UartRegs) }
}

pub fn mac() -> &'static MacRegs {
    // SAFETY: as above.
    unsafe { &*(ETH_BASE as *const MacRegs) }
}

/// Toggle a board LED.
pub fn led_toggle(mask: u8) {
    // SAFETY: byte-wide GPIO data register.
    unsafe {
        let p = PEDR as *mut u8;
        p.write_volatile(p.read_volatile() ^ mask);
    }
}

pub fn led_clear(mask: u8) {
    // SAFETY: as above.
    unsafe {
        let p = PEDR as *mut u8;
        p.write_volatile(p.read_volatile() & !mask);
    }
}
