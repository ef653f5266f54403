//! EP9301 Ethernet MAC driver.
//!
//! The device owns two descriptor rings and two status rings. Receive
//! buffers are pre-enqueued; the MAC DMAs frames in and posts receive
//! status entries, and the ISR walks its own cursor up to the device's,
//! re-enqueueing what it consumed. Transmit is the dual, with the status
//! walk only confirming completions.

use alloc::boxed::Box;

use tock_registers::interfaces::{Readable, Writeable};

use crate::arch::regs::{
    self, BMCTL, BMSTS, INTEN, INTSTS, MIICMD, MIISTS, RXCTL, SELFCTL, TXCTL,
};
use crate::config::{BOARD_IP, BOARD_NET, BOARD_NETMASK, ETH_BUF_SIZE, ETH_RX_RING, ETH_TX_RING};
use crate::eth::{self, BindState, EthDriver, EthStats, IpDesc, NetError, ETH_MAX_FRAME};
use crate::ip::{Route, RouteFlags};
use crate::pkt::Pkt;
use crate::sched::{self, TaskMode};
use crate::sync::IrqMutex;
use crate::syscall::user;

const PHY_ADDR: u32 = 1;

/// MDC divisor for the MII management clock.
const MDCDIV: u32 = 7;

#[repr(C)]
struct RxDesc {
    buf_addr: u32,
    /// Buffer length (16) | buffer index (15) | not-start-of-frame (1).
    ctrl: u32,
}

#[repr(C)]
struct RxSts {
    status: u32,
    /// Frame length (16) | buffer index (15) | frame-processed (1).
    frame: u32,
}

#[repr(C)]
struct TxDesc {
    buf_addr: u32,
    /// Buffer length (12) | command (4) | buffer index (15) | EOF (1).
    ctrl: u32,
}

const TX_DESC_EOF: u32 = 1 << 31;

#[repr(C)]
struct TxSts {
    /// Buffer index (15) | frame status (15) | TxFP (1) | TxWE (1).
    status: u32,
}

const TX_STS_WE: u32 = 1 << 31;

struct MacState {
    ifindex: usize,
    rx_desc: *mut RxDesc,
    rx_sts: *mut RxSts,
    tx_desc: *mut TxDesc,
    tx_sts: *mut TxSts,
    rx_buf: *mut u8,
    tx_buf: *mut u8,
    /// ISR cursor into the receive status ring.
    rx_last: usize,
    /// ISR cursor into the transmit status ring.
    tx_sts_last: usize,
    /// Next transmit descriptor to fill.
    tx_next: usize,
}

// SAFETY: the pointers address bump-tier DMA memory owned by this driver;
// every access happens under the state lock on a single core.
unsafe impl Send for MacState {}

static MAC_STATE: IrqMutex<Option<MacState>> = IrqMutex::new(None);

// ── MII management ──────────────────────────────────────────────────────────

fn mii_write(reg: u32, data: u16) {
    let m = regs::mac();
    m.miidata.set(data as u32);
    m.miicmd
        .write(MIICMD::WRITE::SET + MIICMD::PHYAD.val(PHY_ADDR) + MIICMD::REGAD.val(reg));
    while m.miists.is_set(MIISTS::BUSY) {}
}

fn mii_read(reg: u32) -> u16 {
    let m = regs::mac();
    m.miicmd
        .write(MIICMD::READ::SET + MIICMD::PHYAD.val(PHY_ADDR) + MIICMD::REGAD.val(reg));
    while m.miists.is_set(MIISTS::BUSY) {}
    m.miidata.get() as u16
}

// ── Interrupt service ───────────────────────────────────────────────────────

fn process_rx(st: &mut MacState) {
    let m = regs::mac();
    let cur_addr = m.rxstsq_cur_add.get() as usize;
    let base = st.rx_sts as usize;
    let cur = (cur_addr.wrapping_sub(base) / core::mem::size_of::<RxSts>()) % ETH_RX_RING;

    let mut q = 0usize;
    loop {
        q += 1;

        // SAFETY: rx_last stays within the ring; the MAC posted this
        // entry before moving its cursor past it.
        let sts = unsafe { st.rx_sts.add(st.rx_last).read_volatile() };
        let frame_len = (sts.frame & 0xFFFF) as usize;
        let index = ((sts.frame >> 16) & 0x7FFF) as usize;

        eth::stats_update(st.ifindex, |s| {
            s.rx_frames += 1;
            s.rx_bytes += frame_len as u32;
        });

        if frame_len < eth::ETH_MIN_FRAME {
            // Status entries for zero-length frames appear right after
            // reset; counted with the runts until that is understood.
            eth::stats_update(st.ifindex, |s| s.runts += 1);
        } else if frame_len > ETH_MAX_FRAME {
            eth::stats_update(st.ifindex, |s| s.oversized += 1);
        } else {
            match Pkt::alloc(frame_len) {
                Ok(mut pkt) => {
                    // SAFETY: the descriptor's buffer is index*BUF_SIZE
                    // into the receive arena and holds frame_len valid
                    // bytes.
                    let src = unsafe {
                        core::slice::from_raw_parts(
                            st.rx_buf.add(index * ETH_BUF_SIZE),
                            frame_len,
                        )
                    };
                    let _ = pkt.add_tail(src);
                    eth::eth_rx(st.ifindex, pkt);
                }
                Err(_) => {
                    crate::kprintln!("eth: rx frame dropped, no packet memory");
                }
            }
        }

        st.rx_last += 1;
        if st.rx_last >= ETH_RX_RING {
            st.rx_last = 0;
        }
        if st.rx_last == cur || q >= ETH_RX_RING {
            break;
        }
    }

    // Hand the consumed descriptors and status slots back to the MAC.
    m.rxsts_enq.set(q as u32);
    m.rxd_enq.set(q as u32);
}

fn process_tx(st: &mut MacState) {
    let m = regs::mac();
    let cur_addr = m.txstsq_cur_add.get() as usize;
    let base = st.tx_sts as usize;
    let cur = (cur_addr.wrapping_sub(base) / core::mem::size_of::<TxSts>()) % ETH_TX_RING;

    let mut q = 0usize;
    while st.tx_sts_last != cur && q < ETH_TX_RING {
        q += 1;

        // SAFETY: cursor stays within the ring.
        let sts = unsafe { st.tx_sts.add(st.tx_sts_last).read_volatile() };
        if sts.status & TX_STS_WE == 0 {
            crate::kprintln!("eth: frame xmit failed: {:#x}", sts.status);
            eth::stats_update(st.ifindex, |s| s.fcs_errors += 1);
        }

        st.tx_sts_last += 1;
        if st.tx_sts_last >= ETH_TX_RING {
            st.tx_sts_last = 0;
        }
    }
}

fn eth_isr() {
    let m = regs::mac();
    let sts = m.intstsc.extract(); // read clears the pending bits

    let mut state = MAC_STATE.lock();
    if let Some(st) = state.as_mut() {
        if sts.is_set(INTSTS::RXSQ) {
            process_rx(st);
        }
        if sts.is_set(INTSTS::TXSQ) {
            process_tx(st);
        }
    }
}

// ── Bring-up ────────────────────────────────────────────────────────────────

/// Full MAC+PHY reset and ring programming, following the controller's
/// documented bring-up order.
fn mac_reset(irq_line: u32) -> Result<(), NetError> {
    let m = regs::mac();

    m.selfctl.write(SELFCTL::RESET::SET);
    while m.selfctl.is_set(SELFCTL::RESET) {}

    mii_write(regs::MII_CONTROL, regs::MII_CONTROL_RESET);
    while mii_read(regs::MII_CONTROL) & regs::MII_CONTROL_RESET != 0 {}

    crate::kprintln!("eth: MAC+PHY reset, autonegotiation enabled");

    m.selfctl.write(SELFCTL::MDCDIV.val(MDCDIV));

    mii_write(regs::MII_AUTONG_ADV, regs::MII_ADV_ALL);
    mii_write(
        regs::MII_CONTROL,
        regs::MII_CONTROL_AUTONEG_EN | regs::MII_CONTROL_RESTART_AUTONEG,
    );

    crate::kprintln!("eth: waiting for link...");
    while mii_read(regs::MII_STATUS) & regs::MII_STATUS_AUTONEG_DONE == 0 {
        user::sleep(250);
    }

    m.selfctl
        .write(SELFCTL::MDCDIV.val(MDCDIV) + SELFCTL::PSPRS::SET);

    {
        let state = MAC_STATE.lock();
        let st = state.as_ref().ok_or(NetError::NoDevice)?;

        m.rxdq_badd.set(st.rx_desc as u32);
        m.rxd_cur_add.set(st.rx_desc as u32);
        m.rxdq_blen
            .set((ETH_RX_RING * core::mem::size_of::<RxDesc>()) as u16);

        m.rxstsq_badd.set(st.rx_sts as u32);
        m.rxstsq_cur_add.set(st.rx_sts as u32);
        m.rxstsq_blen
            .set((ETH_RX_RING * core::mem::size_of::<RxSts>()) as u16);

        m.bmctl.write(BMCTL::RXEN::SET);

        m.txdq_badd.set(st.tx_desc as u32);
        m.txdq_cur_add.set(st.tx_desc as u32);
        m.txdq_blen
            .set((ETH_TX_RING * core::mem::size_of::<TxDesc>()) as u16);

        m.txstsq_badd.set(st.tx_sts as u32);
        m.txstsq_cur_add.set(st.tx_sts as u32);
        m.txstsq_blen
            .set((ETH_TX_RING * core::mem::size_of::<TxSts>()) as u16);

        m.bmctl.write(BMCTL::RXEN::SET + BMCTL::TXEN::SET);
    }

    if crate::irq::register_irq(irq_line, eth_isr).is_err() {
        crate::kprintln!("eth: failed to register MAC IRQ handler");
        return Err(NetError::NoDevice);
    }

    // Receive engine up, then prime the rings.
    while !m.bmsts.is_set(BMSTS::RXACT) {}
    m.rxd_enq.set(ETH_RX_RING as u32);
    m.rxsts_enq.set(ETH_RX_RING as u32);

    // Broadcast, our own address, and runts with a good CRC.
    m.rxctl
        .write(RXCTL::SRXON::SET + RXCTL::BA::SET + RXCTL::IA0::SET + RXCTL::RCRCA::SET);
    m.txctl.write(TXCTL::STXON::SET);

    m.inten
        .write(INTEN::REOFIE::SET + INTEN::REOBIE::SET + INTEN::RHDRIE::SET + INTEN::PHYSIE::SET);
    let _ = m.intstsc.get(); // clear anything pending
    m.gintmsk.write(regs::GINTMSK::INT::SET);
    crate::irq::enable_irq(irq_line);

    Ok(())
}

pub struct Ep9301Eth {
    irq_line: u32,
}

impl EthDriver for Ep9301Eth {
    fn open(&mut self) -> Result<(), NetError> {
        mac_reset(self.irq_line)
    }

    fn xmit(&mut self, pkt: Pkt, stats: &mut EthStats) -> Result<(), NetError> {
        if pkt.len() > ETH_MAX_FRAME {
            crate::kprintln!("eth: attempted to xmit oversized frame");
            return Err(NetError::Oversized);
        }

        let mut state = MAC_STATE.lock();
        let st = state.as_mut().ok_or(NetError::NoDevice)?;

        let index = st.tx_next;
        // SAFETY: descriptor index stays within the ring; its buffer is
        // index*BUF_SIZE into the transmit arena.
        unsafe {
            let dst = st.tx_buf.add(index * ETH_BUF_SIZE);
            core::ptr::copy_nonoverlapping(pkt.data().as_ptr(), dst, pkt.len());

            let d = st.tx_desc.add(index);
            let buf_addr = (*d).buf_addr;
            d.write_volatile(TxDesc {
                buf_addr,
                ctrl: TX_DESC_EOF | ((index as u32) << 16) | (pkt.len() as u32 & 0xFFF),
            });
        }

        stats.tx_frames += 1;
        stats.tx_bytes += pkt.len() as u32;

        st.tx_next += 1;
        if st.tx_next >= ETH_TX_RING {
            st.tx_next = 0;
        }

        regs::mac().txd_enq.set(1);
        Ok(())
        // pkt freed on return: the frame now lives in the descriptor
        // buffer.
    }
}

/// Poll the PHY for link transitions.
fn link_watch_task() {
    let mut last_link = false;
    loop {
        let sts = mii_read(regs::MII_STATUS);
        let link = sts & regs::MII_STATUS_LINK != 0;

        if link != last_link {
            if link {
                crate::kprintln!("eth: link UP ({:#x})", sts);
            } else {
                crate::kprintln!("eth: link DOWN ({:#x})", sts);
            }
            last_link = link;
        }

        user::sleep(2000);
    }
}

/// Bring-up task: opens the device away from the boot path, because the
/// PHY wait sleeps.
fn eth_service_task() {
    let open_rc = {
        let ifindex = MAC_STATE.lock().as_ref().map(|s| s.ifindex);
        match ifindex {
            Some(_) => Ep9301Eth {
                irq_line: regs::INT_MAC,
            }
            .open(),
            None => Err(NetError::NoDevice),
        }
    };

    if open_rc.is_err() {
        crate::kprintln!("eth: device open failed");
        return;
    }

    link_watch_task();
}

/// Read the loader-programmed station address.
fn read_mac_addr() -> eth::MacAddr {
    let m = regs::mac();
    let lo = m.indad[0].get();
    let hi = m.indad[1].get();
    [
        lo as u8,
        (lo >> 8) as u8,
        (lo >> 16) as u8,
        (lo >> 24) as u8,
        hi as u8,
        (hi >> 8) as u8,
    ]
}

/// Allocate the DMA arenas, register the interface, assign the static
/// address and route, and start the service tasks.
pub fn init() {
    let rx_buf = crate::kalloc::early_alloc(ETH_RX_RING * ETH_BUF_SIZE);
    let tx_buf = crate::kalloc::early_alloc(ETH_TX_RING * ETH_BUF_SIZE);
    let rx_desc =
        crate::kalloc::early_alloc(ETH_RX_RING * core::mem::size_of::<RxDesc>()) as *mut RxDesc;
    let rx_sts =
        crate::kalloc::early_alloc(ETH_RX_RING * core::mem::size_of::<RxSts>()) as *mut RxSts;
    let tx_desc =
        crate::kalloc::early_alloc(ETH_TX_RING * core::mem::size_of::<TxDesc>()) as *mut TxDesc;
    let tx_sts =
        crate::kalloc::early_alloc(ETH_TX_RING * core::mem::size_of::<TxSts>()) as *mut TxSts;

    if rx_buf.is_null()
        || tx_buf.is_null()
        || rx_desc.is_null()
        || rx_sts.is_null()
        || tx_desc.is_null()
        || tx_sts.is_null()
    {
        crate::kprintln!("eth: failed to allocate descriptor memory");
        return;
    }

    // SAFETY: freshly allocated, exclusively owned arenas.
    unsafe {
        for i in 0..ETH_RX_RING {
            rx_desc.add(i).write(RxDesc {
                buf_addr: rx_buf.add(i * ETH_BUF_SIZE) as u32,
                ctrl: ((i as u32) << 16) | (ETH_BUF_SIZE as u32 & 0xFFFF),
            });
            rx_sts.add(i).write(RxSts { status: 0, frame: 0 });
        }
        for i in 0..ETH_TX_RING {
            tx_desc.add(i).write(TxDesc {
                buf_addr: tx_buf.add(i * ETH_BUF_SIZE) as u32,
                ctrl: (i as u32) << 16,
            });
            tx_sts.add(i).write(TxSts { status: 0 });
        }
    }

    let mac = read_mac_addr();
    let ifindex = eth::register_if(
        "ep9301",
        mac,
        regs::INT_MAC,
        Box::new(Ep9301Eth {
            irq_line: regs::INT_MAC,
        }),
    );

    *MAC_STATE.lock() = Some(MacState {
        ifindex,
        rx_desc,
        rx_sts,
        tx_desc,
        tx_sts,
        rx_buf,
        tx_buf,
        rx_last: 0,
        tx_sts_last: 0,
        tx_next: 0,
    });

    eth::set_bound(ifindex, BindState::BoundNet);

    if eth::add_ip(
        ifindex,
        IpDesc {
            addr: BOARD_IP,
            netmask: BOARD_NETMASK,
            broadcast: BOARD_NET | !BOARD_NETMASK,
        },
    )
    .is_err()
    {
        crate::kprintln!("eth: failed to assign address");
        return;
    }

    if crate::ip::route_add(Route {
        dst: BOARD_NET,
        netmask: BOARD_NETMASK,
        gw: 0,
        flags: RouteFlags::UP,
        metric: 1,
        ifindex,
    })
    .is_err()
    {
        crate::kprintln!("eth: failed to add local route");
    }

    if sched::spawn(eth_service_task, "[eth_ep9301]", TaskMode::System).is_err() {
        crate::kprintln!("eth: failed to spawn service task");
    }
}
