//! IPv4: input validation and demux, output with route and ARP
//! resolution, and the route table.
//!
//! Datagrams that miss the ARP cache are parked on a pending queue and
//! released when the reply lands, so resolution never blocks the caller.

use alloc::vec::Vec;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::eth::{self, NetError, ETH_TYPE_IPV4};
use crate::pkt::{ocksum16, Pkt};
use crate::sync::IrqMutex;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_UDP: u8 = 17;

pub const IP_HDR_LEN: usize = 20;
const IP_TTL: u8 = 64;

/// An Ethernet frame padded to the 60-byte minimum carries 46 payload
/// bytes; the link layer does not strip the padding.
const ETH_MIN_PAYLOAD: usize = 46;

/// IPv4 header without options, as on the wire.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct Ipv4Hdr {
    /// Version in the high nibble, header length in 32-bit words in the
    /// low.
    pub ver_ihl: u8,
    pub tos: u8,
    pub len: U16,
    pub id: U16,
    pub flags_frag: U16,
    pub ttl: u8,
    pub proto: u8,
    pub cksum: U16,
    pub src: U32,
    pub dst: U32,
}

const_assert_eq!(core::mem::size_of::<Ipv4Hdr>(), IP_HDR_LEN);

impl Ipv4Hdr {
    pub fn version(&self) -> u8 {
        self.ver_ihl >> 4
    }

    /// Header length in bytes.
    pub fn ihl_bytes(&self) -> usize {
        ((self.ver_ihl & 0x0F) as usize) * 4
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RouteFlags: u8 {
        /// Route is usable.
        const UP = 0x01;
        /// Destination is a single host, not a network.
        const HOST = 0x02;
        /// Traffic goes through the gateway address.
        const GATEWAY = 0x04;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Route {
    /// Destination network/host, host byte order.
    pub dst: u32,
    pub netmask: u32,
    /// Next hop for gateway routes; 0 for directly attached.
    pub gw: u32,
    pub flags: RouteFlags,
    /// Lower is preferred among matching routes.
    pub metric: u8,
    pub ifindex: usize,
}

static ROUTES: IrqMutex<Vec<Route>> = IrqMutex::new(Vec::new());

/// Datagrams parked while ARP resolves their next hop.
struct PendingDatagram {
    next_hop: u32,
    dst: u32,
    proto: u8,
    pkt: Pkt,
}

static ARP_PENDING: IrqMutex<Vec<PendingDatagram>> = IrqMutex::new(Vec::new());

static IP_ID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

// ── Route table ─────────────────────────────────────────────────────────────

/// Add a route. A route with the same destination, mask and interface is a
/// duplicate and is rejected.
pub fn route_add(new: Route) -> Result<(), NetError> {
    let mut routes = ROUTES.lock();
    if routes
        .iter()
        .any(|r| r.dst == new.dst && r.netmask == new.netmask && r.ifindex == new.ifindex)
    {
        return Err(NetError::Malformed);
    }
    routes.push(new);
    Ok(())
}

pub fn route_del(dst: u32, netmask: u32, ifindex: usize) {
    ROUTES
        .lock()
        .retain(|r| !(r.dst == dst && r.netmask == netmask && r.ifindex == ifindex));
}

/// Lowest-metric route whose masked destination matches `dst`.
pub fn route_lookup(dst: u32) -> Option<Route> {
    let routes = ROUTES.lock();
    let mut best: Option<&Route> = None;
    for r in routes.iter() {
        if dst & r.netmask == r.dst {
            best = match best {
                Some(b) if b.metric <= r.metric => Some(b),
                _ => Some(r),
            };
        }
    }
    best.copied()
}

pub fn route_snapshot(mut f: impl FnMut(&Route)) {
    for r in ROUTES.lock().iter() {
        f(r);
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

/// Validate and demultiplex one datagram. Consumes the packet: protocol
/// handlers take ownership, every failure path drops it here.
pub fn input(mut pkt: Pkt) -> Result<(), NetError> {
    let (ihl, total_len, proto) = {
        let hdr = match Ipv4Hdr::ref_from_prefix(pkt.data()) {
            Ok((h, _)) => h,
            Err(_) => {
                crate::kprintln!("ip: dropped runt datagram ({} bytes)", pkt.len());
                return Err(NetError::Malformed);
            }
        };
        (hdr.ihl_bytes(), hdr.len.get() as usize, hdr.proto)
    };

    // The checksum walks the whole header, so bound it first.
    if ihl > pkt.len() {
        crate::kprintln!("ip: dropped packet with invalid length: {}", pkt.len());
        return Err(NetError::Malformed);
    }

    let sum = ocksum16(&pkt.data()[..ihl]);
    if sum != 0xFFFF {
        crate::kprintln!("ip: dropped packet with bad cksum ({:#x})", sum);
        return Err(NetError::Malformed);
    }

    // Minimum-size Ethernet frames reach us padded; when the declared
    // total is smaller, the declaration wins.
    if pkt.len() == ETH_MIN_PAYLOAD && total_len < ETH_MIN_PAYLOAD {
        pkt.truncate(total_len);
    }

    if ihl < IP_HDR_LEN || total_len != pkt.len() {
        crate::kprintln!(
            "ip: dropped packet with invalid length (ihl {} len {} pkt {})",
            ihl,
            total_len,
            pkt.len()
        );
        return Err(NetError::Malformed);
    }

    match proto {
        IP_PROTO_ICMP => crate::icmp::input(pkt),
        IP_PROTO_UDP => crate::udp::input(pkt),
        _ => Ok(()), // unknown protocol, drop
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

fn build_header(payload_len: usize, src: u32, dst: u32, proto: u8) -> Ipv4Hdr {
    use core::sync::atomic::Ordering;

    let mut hdr = Ipv4Hdr {
        ver_ihl: 0x45,
        tos: 0,
        len: U16::new((payload_len + IP_HDR_LEN) as u16),
        id: U16::new(IP_ID.fetch_add(1, Ordering::Relaxed) as u16),
        flags_frag: U16::new(0),
        ttl: IP_TTL,
        proto,
        cksum: U16::new(0),
        src: U32::new(src),
        dst: U32::new(dst),
    };
    hdr.cksum = U16::new(!ocksum16(hdr.as_bytes()));
    hdr
}

/// Route `pkt` to `dst` and hand it to the link layer. On an ARP miss the
/// datagram is parked and a request goes out; the reply releases it.
pub fn output(pkt: Pkt, dst: u32, proto: u8) -> Result<(), NetError> {
    let rt = match route_lookup(dst) {
        Some(rt) => rt,
        None => {
            crate::kprintln!("ip: no route to host {:#010x}", dst);
            return Err(NetError::NoRoute);
        }
    };

    let next_hop = if rt.flags.contains(RouteFlags::GATEWAY) && rt.gw != 0 {
        rt.gw
    } else {
        dst
    };

    match crate::arp::cache_lookup(next_hop) {
        Some(mac) => emit(rt.ifindex, pkt, dst, proto, &mac),
        None => {
            crate::arp::request(rt.ifindex, next_hop)?;
            ARP_PENDING.lock().push(PendingDatagram {
                next_hop,
                dst,
                proto,
                pkt,
            });
            Ok(())
        }
    }
}

fn emit(ifindex: usize, mut pkt: Pkt, dst: u32, proto: u8, mac: &eth::MacAddr) -> Result<(), NetError> {
    let src = eth::first_ip(ifindex).ok_or(NetError::NoDevice)?;
    let hdr = build_header(pkt.len(), src, dst, proto);
    pkt.add_head(hdr.as_bytes()).map_err(|_| NetError::NoMemory)?;
    eth::output(ifindex, pkt, mac, ETH_TYPE_IPV4)
}

/// ARP learned `ip`; release every datagram parked on it.
pub fn arp_resolved(ip: u32) {
    loop {
        let parked = {
            let mut pending = ARP_PENDING.lock();
            match pending.iter().position(|p| p.next_hop == ip) {
                Some(i) => pending.swap_remove(i),
                None => break,
            }
        };
        let _ = output(parked.pkt, parked.dst, parked.proto);
    }
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    ROUTES.lock().clear();
    ARP_PENDING.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::testdev::MockDriver;
    use crate::eth::{BindState, ETH_HLEN};
    use crate::testutil::kernel_lock;
    use alloc::boxed::Box;

    const LOCAL_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const PEER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];
    const LOCAL_IP: u32 = u32::from_be_bytes([192, 168, 0, 99]);
    const PEER_IP: u32 = u32::from_be_bytes([192, 168, 0, 2]);

    fn setup() -> (usize, std::sync::Arc<std::sync::Mutex<Vec<std::vec::Vec<u8>>>>) {
        crate::sched::reset_for_test();
        crate::sched::sched_init().unwrap();
        crate::eth::reset_for_test();
        crate::arp::reset_for_test();
        reset_for_test();

        let (drv, sent) = MockDriver::new();
        let ifindex = eth::register_if("test0", LOCAL_MAC, 39, Box::new(drv));
        eth::set_bound(ifindex, BindState::BoundNet);
        eth::add_ip(
            ifindex,
            eth::IpDesc {
                addr: LOCAL_IP,
                netmask: 0xFFFF_FF00,
                broadcast: LOCAL_IP | 0xFF,
            },
        )
        .unwrap();
        route_add(Route {
            dst: LOCAL_IP & 0xFFFF_FF00,
            netmask: 0xFFFF_FF00,
            gw: 0,
            flags: RouteFlags::UP,
            metric: 1,
            ifindex,
        })
        .unwrap();
        (ifindex, sent)
    }

    fn valid_header(payload_len: usize, proto: u8) -> Ipv4Hdr {
        build_header(payload_len, PEER_IP, LOCAL_IP, proto)
    }

    #[test]
    fn route_lookup_prefers_lowest_metric() {
        let _g = kernel_lock();
        let (ifindex, _) = setup();

        // A second, worse route to the same network on another interface
        // id; the /24 with metric 1 must win.
        route_add(Route {
            dst: 0,
            netmask: 0,
            gw: u32::from_be_bytes([192, 168, 0, 1]),
            flags: RouteFlags::UP | RouteFlags::GATEWAY,
            metric: 10,
            ifindex,
        })
        .unwrap();

        let rt = route_lookup(PEER_IP).unwrap();
        assert_eq!(rt.metric, 1);

        // Something off-net only matches the default route.
        let rt = route_lookup(u32::from_be_bytes([8, 8, 8, 8])).unwrap();
        assert_eq!(rt.metric, 10);
        assert!(rt.flags.contains(RouteFlags::GATEWAY));
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let _g = kernel_lock();
        let (ifindex, _) = setup();
        let dup = Route {
            dst: LOCAL_IP & 0xFFFF_FF00,
            netmask: 0xFFFF_FF00,
            gw: 0,
            flags: RouteFlags::UP,
            metric: 5,
            ifindex,
        };
        assert!(route_add(dup).is_err());
    }

    #[test]
    fn route_del_removes_match() {
        let _g = kernel_lock();
        let (ifindex, _) = setup();
        route_del(LOCAL_IP & 0xFFFF_FF00, 0xFFFF_FF00, ifindex);
        assert!(route_lookup(PEER_IP).is_none());
    }

    #[test]
    fn output_header_checksums_to_all_ones() {
        let _g = kernel_lock();
        let (_ifindex, sent) = setup();
        crate::arp::cache_insert(PEER_MAC, PEER_IP);

        let mut pkt = Pkt::alloc(8).unwrap();
        pkt.add_tail(&[0u8; 8]).unwrap();
        output(pkt, PEER_IP, IP_PROTO_UDP).unwrap();
        crate::eth::drain_for_test();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let ip = &frames[0][ETH_HLEN..];
        // Verifying a header that carries its checksum folds to 0xFFFF.
        assert_eq!(ocksum16(&ip[..IP_HDR_LEN]), 0xFFFF);

        let (hdr, _) = Ipv4Hdr::ref_from_prefix(ip).unwrap();
        assert_eq!(hdr.version(), 4);
        assert_eq!(hdr.ihl_bytes(), 20);
        assert_eq!(hdr.ttl, 64);
        assert_eq!(hdr.src.get(), LOCAL_IP);
        assert_eq!(hdr.dst.get(), PEER_IP);
        assert_eq!(hdr.len.get(), 28);
    }

    #[test]
    fn arp_miss_parks_and_resolution_releases() {
        let _g = kernel_lock();
        let (_ifindex, sent) = setup();

        let mut pkt = Pkt::alloc(4).unwrap();
        pkt.add_tail(&[1, 2, 3, 4]).unwrap();
        output(pkt, PEER_IP, IP_PROTO_UDP).unwrap();
        crate::eth::drain_for_test();

        {
            // Only the ARP request went out so far.
            let frames = sent.lock().unwrap();
            assert_eq!(frames.len(), 1);
            let ethertype = u16::from_be_bytes([frames[0][12], frames[0][13]]);
            assert_eq!(ethertype, crate::eth::ETH_TYPE_ARP);
        }

        crate::arp::cache_insert(PEER_MAC, PEER_IP);
        arp_resolved(PEER_IP);
        crate::eth::drain_for_test();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 2);
        let ethertype = u16::from_be_bytes([frames[1][12], frames[1][13]]);
        assert_eq!(ethertype, ETH_TYPE_IPV4);
        assert_eq!(&frames[1][..6], &PEER_MAC);
    }

    #[test]
    fn input_rejects_bad_checksum() {
        let _g = kernel_lock();
        setup();

        let mut hdr = valid_header(0, IP_PROTO_UDP);
        hdr.cksum = U16::new(0xDEAD);
        let mut pkt = Pkt::alloc(IP_HDR_LEN).unwrap();
        pkt.add_tail(hdr.as_bytes()).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));
    }

    #[test]
    fn input_rejects_length_mismatch() {
        let _g = kernel_lock();
        setup();

        // Header declares 20 + 8 but the packet carries 20 + 4.
        let hdr = valid_header(8, IP_PROTO_UDP);
        let mut pkt = Pkt::alloc(IP_HDR_LEN + 4).unwrap();
        pkt.add_tail(hdr.as_bytes()).unwrap();
        pkt.add_tail(&[0u8; 4]).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));
    }

    #[test]
    fn input_trusts_declared_length_on_padded_minimum_frame() {
        let _g = kernel_lock();
        setup();

        // 8 payload bytes declared, padded out to the 46-byte Ethernet
        // minimum payload by the link layer.
        let hdr = valid_header(8, 0xFE); // unknown proto: dropped after checks
        let mut pkt = Pkt::alloc(ETH_MIN_PAYLOAD).unwrap();
        pkt.add_tail(hdr.as_bytes()).unwrap();
        pkt.add_tail(&[0xAB; 8]).unwrap();
        pkt.add_tail(&[0u8; ETH_MIN_PAYLOAD - IP_HDR_LEN - 8]).unwrap();
        assert_eq!(pkt.len(), ETH_MIN_PAYLOAD);

        // Passes validation because the declared total wins over padding.
        assert_eq!(input(pkt), Ok(()));
    }

    #[test]
    fn input_rejects_truncated_header() {
        let _g = kernel_lock();
        setup();

        let mut pkt = Pkt::alloc(8).unwrap();
        pkt.add_tail(&[0x45, 0, 0, 8, 0, 0, 0, 0]).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));
    }
}
