//! Ethernet link layer.
//!
//! Interfaces register here with an operations object; received frames are
//! queued per interface by the driver ISR, and a dedicated RX task drains
//! the queues and demultiplexes by EtherType. Transmission is also
//! task-side: `output` stages frames on the interface TX queue and a TX
//! task hands them to the driver, so a full descriptor ring blocks a task
//! instead of an interrupt handler.
//!
//! A packet is owned by exactly one stage at a time: driver ISR → RX queue
//! → RX task → protocol layer, or protocol layer → TX queue → driver.
//! Handing a packet to the next stage moves it.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ETH_RX_WAITERS, ETH_TX_PACE_MS, EV_ETH_TX};
use crate::pkt::Pkt;
use crate::sched::{self, TaskMode};
use crate::sync::{Completion, IrqMutex};
use crate::syscall::user;
use crate::time::ms_to_ticks;

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const IFNAMSIZ: usize = 8;

/// Frames shorter than this are runts; longer than the max are oversized.
pub const ETH_MIN_FRAME: usize = 60;
pub const ETH_MAX_FRAME: usize = 1518;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub type MacAddr = [u8; ETH_ALEN];

pub const MAC_BCAST: MacAddr = [0xFF; ETH_ALEN];

/// Ethernet II header, exactly as on the wire.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EthHdr {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: U16,
}

const_assert_eq!(core::mem::size_of::<EthHdr>(), ETH_HLEN);

#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct EthStats {
    pub rx_bytes: u32,
    pub tx_bytes: u32,
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub runts: u32,
    pub oversized: u32,
    pub fcs_errors: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindState {
    /// No stack attached; received frames are discarded.
    Unbound,
    /// Attached to the network stack.
    BoundNet,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetError {
    NoMemory,
    /// Frame exceeds the link maximum.
    Oversized,
    /// No such interface, or no interface at all.
    NoDevice,
    /// Descriptor ring or queue out of room.
    QueueFull,
    /// Malformed packet dropped at validation.
    Malformed,
    /// No route to the destination.
    NoRoute,
}

/// An IP address assigned to an interface.
#[derive(Clone, Copy, Debug)]
pub struct IpDesc {
    pub addr: u32,
    pub netmask: u32,
    pub broadcast: u32,
}

/// Device driver operations an interface is registered with.
pub trait EthDriver: Send {
    /// Bring the hardware up. Runs from the interface's service task.
    fn open(&mut self) -> Result<(), NetError>;
    /// Put one frame on the wire, consuming it. Updates the interface
    /// counters on success.
    fn xmit(&mut self, pkt: Pkt, stats: &mut EthStats) -> Result<(), NetError>;
    /// Quiesce the hardware.
    fn release(&mut self) {}
}

pub struct EthIf {
    pub name: heapless::String<IFNAMSIZ>,
    pub mac: MacAddr,
    pub irq: u32,
    pub mtu: u16,
    driver: Box<dyn EthDriver>,
    pub stats: EthStats,
    rx_queue: VecDeque<Pkt>,
    tx_queue: VecDeque<Pkt>,
    pub ips: Vec<IpDesc>,
    pub bound: BindState,
}

static INTERFACES: IrqMutex<Vec<EthIf>> = IrqMutex::new(Vec::new());

lazy_static! {
    /// Wakes the RX task when any interface has queued frames.
    static ref RX_WAIT: Completion = Completion::new(ETH_RX_WAITERS);
}

/// Register a new interface. Returns its index, the handle everything else
/// uses (packets carry it as their receive stamp).
pub fn register_if(
    name: &str,
    mac: MacAddr,
    irq: u32,
    driver: Box<dyn EthDriver>,
) -> usize {
    let mut ifname = heapless::String::new();
    let _ = ifname.push_str(name);

    let mut ifs = INTERFACES.lock();
    ifs.push(EthIf {
        name: ifname,
        mac,
        irq,
        mtu: 1500,
        driver,
        stats: EthStats::default(),
        rx_queue: VecDeque::new(),
        tx_queue: VecDeque::new(),
        ips: Vec::new(),
        bound: BindState::Unbound,
    });
    let index = ifs.len() - 1;
    drop(ifs);

    crate::kprintln!("eth: registered {} (irq {})", name, irq);
    index
}

pub fn set_bound(ifindex: usize, bound: BindState) {
    if let Some(i) = INTERFACES.lock().get_mut(ifindex) {
        i.bound = bound;
    }
}

pub fn add_ip(ifindex: usize, desc: IpDesc) -> Result<(), NetError> {
    let mut ifs = INTERFACES.lock();
    let i = ifs.get_mut(ifindex).ok_or(NetError::NoDevice)?;
    i.ips.push(desc);
    Ok(())
}

/// First IP assigned to the interface, the source address for locally
/// originated traffic.
pub fn first_ip(ifindex: usize) -> Option<u32> {
    INTERFACES
        .lock()
        .get(ifindex)
        .and_then(|i| i.ips.first())
        .map(|d| d.addr)
}

/// Does `addr` belong to the given interface?
pub fn if_has_ip(ifindex: usize, addr: u32) -> bool {
    INTERFACES
        .lock()
        .get(ifindex)
        .map(|i| i.ips.iter().any(|d| d.addr == addr))
        .unwrap_or(false)
}

/// Find the interface owning `addr`, across all interfaces.
pub fn ip_owner(addr: u32) -> Option<usize> {
    let ifs = INTERFACES.lock();
    ifs.iter()
        .position(|i| i.ips.iter().any(|d| d.addr == addr))
}

pub fn if_mac(ifindex: usize) -> Option<MacAddr> {
    INTERFACES.lock().get(ifindex).map(|i| i.mac)
}

pub fn if_count() -> usize {
    INTERFACES.lock().len()
}

/// Name and counters of the first interface, for `netstat`.
pub fn first_if_stats() -> Option<(heapless::String<IFNAMSIZ>, EthStats)> {
    let ifs = INTERFACES.lock();
    ifs.first().map(|i| (i.name.clone(), i.stats))
}

/// Fold driver-observed statistics into the interface counters. Drivers
/// call this from their ISR walk.
pub fn stats_update(ifindex: usize, f: impl FnOnce(&mut EthStats)) {
    if let Some(i) = INTERFACES.lock().get_mut(ifindex) {
        f(&mut i.stats);
    }
}

/// Hand a received frame to the link layer: stamp it with the arrival
/// interface, queue it, and wake the RX task. Callable from the driver
/// ISR.
pub fn eth_rx(ifindex: usize, mut pkt: Pkt) {
    pkt.ifindex = Some(ifindex);
    {
        let mut ifs = INTERFACES.lock();
        match ifs.get_mut(ifindex) {
            Some(i) => i.rx_queue.push_back(pkt),
            None => return,
        }
    }
    sched::wake_all(&RX_WAIT);
}

/// Encapsulate `pkt` for `dst` and stage it on the interface TX queue. The
/// TX task is kicked so the frame does not wait out a full pacing
/// interval.
pub fn output(ifindex: usize, mut pkt: Pkt, dst: &MacAddr, ethertype: u16) -> Result<(), NetError> {
    let src = if_mac(ifindex).ok_or(NetError::NoDevice)?;

    let hdr = EthHdr {
        dst: *dst,
        src,
        ethertype: U16::new(ethertype),
    };
    pkt.add_head(hdr.as_bytes()).map_err(|_| NetError::NoMemory)?;

    {
        let mut ifs = INTERFACES.lock();
        let i = ifs.get_mut(ifindex).ok_or(NetError::NoDevice)?;
        i.tx_queue.push_back(pkt);
    }

    sched::event_set(EV_ETH_TX);
    Ok(())
}

/// Demultiplex one frame by EtherType. Consumes the packet; unknown types
/// are dropped here, the known ones are owned by their protocol layer from
/// this point on.
fn eth_input(mut pkt: Pkt) {
    let ethertype = match EthHdr::ref_from_prefix(pkt.data()) {
        Ok((hdr, _)) => hdr.ethertype.get(),
        Err(_) => return, // shorter than a header, drop
    };

    if pkt.del_head(ETH_HLEN).is_err() {
        return;
    }

    match ethertype {
        ETH_TYPE_ARP => {
            let _ = crate::arp::input(pkt);
        }
        ETH_TYPE_IPV4 => {
            let _ = crate::ip::input(pkt);
        }
        _ => {} // drop
    }
}

/// Pull every queued frame off every interface. Unbound interfaces drop
/// their backlog.
fn rx_drain() {
    let nifs = if_count();
    for ifindex in 0..nifs {
        loop {
            let (pkt, bound) = {
                let mut ifs = INTERFACES.lock();
                match ifs.get_mut(ifindex) {
                    Some(i) => match i.rx_queue.pop_front() {
                        Some(p) => (p, i.bound),
                        None => break,
                    },
                    None => break,
                }
            };

            if bound == BindState::Unbound {
                crate::kprintln!("eth{}: discarded frame on unbound interface", ifindex);
                continue; // pkt dropped here
            }

            // Dispatch with the interface lock released; the protocol
            // layers queue replies through `output`.
            eth_input(pkt);
        }
    }
}

/// Hand every staged frame on every interface to its driver.
fn tx_drain() {
    let nifs = if_count();
    for ifindex in 0..nifs {
        loop {
            let mut ifs = INTERFACES.lock();
            let i = match ifs.get_mut(ifindex) {
                Some(i) => i,
                None => break,
            };
            let pkt = match i.tx_queue.pop_front() {
                Some(p) => p,
                None => break,
            };

            let EthIf { driver, stats, .. } = i;
            if let Err(e) = driver.xmit(pkt, stats) {
                crate::kprintln!("eth{}: xmit failed: {:?}", ifindex, e);
            }
        }
    }
}

/// Receive service task: parked on the RX completion, drains on every
/// wake.
fn rx_task() {
    loop {
        user::wait(&RX_WAIT);
        rx_drain();
    }
}

/// Transmit service task: drains on a 100 ms pace, or sooner when
/// `output` kicks it.
fn tx_task() {
    loop {
        sched::park_timeout(EV_ETH_TX, ms_to_ticks(ETH_TX_PACE_MS));
        tx_drain();
    }
}

/// Bring up the link-layer service tasks.
pub fn eth_init() -> Result<(), NetError> {
    sched::spawn(tx_task, "[eth_tx]", TaskMode::System).map_err(|_| NetError::NoMemory)?;
    sched::spawn(rx_task, "[eth_rx]", TaskMode::System).map_err(|_| NetError::NoMemory)?;
    Ok(())
}

// ── Test support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn reset_for_test() {
    let mut ifs = INTERFACES.lock();
    ifs.clear();
}

#[cfg(test)]
pub(crate) fn drain_for_test() {
    rx_drain();
    tx_drain();
}

#[cfg(test)]
pub(crate) mod testdev {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures transmitted frames for inspection.
    pub struct MockDriver {
        pub sent: Arc<Mutex<Vec<std::vec::Vec<u8>>>>,
    }

    impl MockDriver {
        pub fn new() -> (Self, Arc<Mutex<Vec<std::vec::Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                MockDriver {
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    impl EthDriver for MockDriver {
        fn open(&mut self) -> Result<(), NetError> {
            Ok(())
        }

        fn xmit(&mut self, pkt: Pkt, stats: &mut EthStats) -> Result<(), NetError> {
            stats.tx_frames += 1;
            stats.tx_bytes += pkt.len() as u32;
            self.sent.lock().unwrap().push(pkt.data().to_vec());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::kernel_lock;
    use testdev::MockDriver;

    fn setup_if() -> (usize, std::sync::Arc<std::sync::Mutex<Vec<std::vec::Vec<u8>>>>) {
        crate::sched::reset_for_test();
        crate::sched::sched_init().unwrap();
        reset_for_test();
        let (drv, sent) = MockDriver::new();
        let mac = [0x02, 0, 0, 0, 0, 0x01];
        let ifindex = register_if("test0", mac, 39, Box::new(drv));
        set_bound(ifindex, BindState::BoundNet);
        (ifindex, sent)
    }

    #[test]
    fn output_prepends_header_and_queues() {
        let _g = kernel_lock();
        let (ifindex, sent) = setup_if();

        let mut pkt = Pkt::alloc(4).unwrap();
        pkt.add_tail(&[1, 2, 3, 4]).unwrap();
        output(ifindex, pkt, &MAC_BCAST, ETH_TYPE_ARP).unwrap();

        tx_drain();
        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(&f[..6], &MAC_BCAST);
        assert_eq!(&f[6..12], &[0x02, 0, 0, 0, 0, 0x01]);
        assert_eq!(u16::from_be_bytes([f[12], f[13]]), ETH_TYPE_ARP);
        assert_eq!(&f[14..], &[1, 2, 3, 4]);
    }

    #[test]
    fn unbound_interface_drops_rx() {
        let _g = kernel_lock();
        let (ifindex, _) = setup_if();
        set_bound(ifindex, BindState::Unbound);

        let mut pkt = Pkt::alloc(64).unwrap();
        pkt.add_tail(&[0u8; 60]).unwrap();
        eth_rx(ifindex, pkt);
        // Drain discards without dispatching; nothing to assert beyond
        // the queue emptying.
        rx_drain();
        let ifs = INTERFACES.lock();
        assert!(ifs[ifindex].rx_queue.is_empty());
    }

    #[test]
    fn rx_stamps_receiving_interface() {
        let _g = kernel_lock();
        let (ifindex, _) = setup_if();

        let mut pkt = Pkt::alloc(64).unwrap();
        pkt.add_tail(&[0u8; 60]).unwrap();
        eth_rx(ifindex, pkt);

        let mut ifs = INTERFACES.lock();
        let queued = ifs[ifindex].rx_queue.pop_front().unwrap();
        assert_eq!(queued.ifindex, Some(ifindex));
    }

    #[test]
    fn xmit_updates_counters() {
        let _g = kernel_lock();
        let (ifindex, _) = setup_if();

        let mut pkt = Pkt::alloc(10).unwrap();
        pkt.add_tail(&[0u8; 10]).unwrap();
        output(ifindex, pkt, &MAC_BCAST, ETH_TYPE_IPV4).unwrap();
        tx_drain();

        let (_, stats) = first_if_stats().unwrap();
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.tx_bytes, 24); // 10 payload + 14 header
    }
}
