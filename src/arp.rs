//! Address Resolution Protocol.
//!
//! Requests for a local address are rewritten in place into replies and
//! queued straight back out of the interface they arrived on. Replies feed
//! the cache, which resolution for outbound traffic consults; duplicate
//! MAC/IP pairs are not re-inserted. All wire fields are big-endian and
//! only converted at the access points.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::eth::{self, MacAddr, NetError, ETH_HLEN, ETH_TYPE_ARP, ETH_TYPE_IPV4, MAC_BCAST};
use crate::pkt::Pkt;
use crate::sync::IrqMutex;
use crate::time;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// Hardware type for Ethernet.
pub const ARP_HRD_ETHERNET: u16 = 1;

pub const ARP_PKT_LEN: usize = 28;

/// ARP message for the only supported pairing: 48-bit hardware addresses
/// over IPv4. The length fields are validated against these sizes before
/// the fixed layout is trusted.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ArpPkt {
    pub htype: U16,
    pub ptype: U16,
    pub hlen: u8,
    pub plen: u8,
    pub opcode: U16,
    pub sha: [u8; 6],
    pub spa: [u8; 4],
    pub tha: [u8; 6],
    pub tpa: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<ArpPkt>(), ARP_PKT_LEN);

/// One resolved MAC/IP pair. `created` is the tick the entry was learned
/// at.
pub struct ArpEntry {
    pub mac: MacAddr,
    pub ip: u32,
    pub created: u32,
}

static ARP_CACHE: IrqMutex<alloc::vec::Vec<ArpEntry>> = IrqMutex::new(alloc::vec::Vec::new());

pub fn cache_lookup(ip: u32) -> Option<MacAddr> {
    ARP_CACHE
        .lock()
        .iter()
        .find(|e| e.ip == ip)
        .map(|e| e.mac)
}

/// Learn a pair. An address already in the cache keeps its original entry.
pub fn cache_insert(mac: MacAddr, ip: u32) {
    let mut cache = ARP_CACHE.lock();
    if cache.iter().any(|e| e.ip == ip) {
        return;
    }
    cache.push(ArpEntry {
        mac,
        ip,
        created: time::ticks(),
    });
}

pub fn cache_snapshot(mut f: impl FnMut(&ArpEntry)) {
    for e in ARP_CACHE.lock().iter() {
        f(e);
    }
}

/// Broadcast a request for `addr` out of `ifindex`, using the interface's
/// first assigned IP as the source protocol address.
pub fn request(ifindex: usize, addr: u32) -> Result<(), NetError> {
    let mac = eth::if_mac(ifindex).ok_or(NetError::NoDevice)?;
    let src_ip = eth::first_ip(ifindex).ok_or(NetError::NoDevice)?;

    let mut pkt = Pkt::alloc(ARP_PKT_LEN + ETH_HLEN).map_err(|_| NetError::NoMemory)?;

    let arp = ArpPkt {
        htype: U16::new(ARP_HRD_ETHERNET),
        ptype: U16::new(ETH_TYPE_IPV4),
        hlen: 6,
        plen: 4,
        opcode: U16::new(ARP_OP_REQUEST),
        sha: mac,
        spa: src_ip.to_be_bytes(),
        tha: MAC_BCAST,
        tpa: addr.to_be_bytes(),
    };
    pkt.add_tail(arp.as_bytes()).map_err(|_| NetError::NoMemory)?;

    eth::output(ifindex, pkt, &MAC_BCAST, ETH_TYPE_ARP)
}

/// Handle an incoming ARP message. Consumes the packet on every path.
pub fn input(pkt: Pkt) -> Result<(), NetError> {
    let (htype, ptype, hlen, plen, opcode) = {
        let arp = match ArpPkt::ref_from_prefix(pkt.data()) {
            Ok((arp, _)) => arp,
            Err(_) => {
                crate::kprintln!("arp: invalid length: {}", pkt.len());
                return Err(NetError::Malformed);
            }
        };
        (
            arp.htype.get(),
            arp.ptype.get(),
            arp.hlen,
            arp.plen,
            arp.opcode.get(),
        )
    };

    if htype != ARP_HRD_ETHERNET {
        crate::kprintln!("arp: discarding unknown hrd: {:#x}", htype);
        return Err(NetError::Malformed);
    }
    if ptype != ETH_TYPE_IPV4 {
        crate::kprintln!("arp: discarding unknown proto: {:#x}", ptype);
        return Err(NetError::Malformed);
    }
    if hlen != 6 || plen != 4 {
        crate::kprintln!("arp: invalid hlen or plen ({}, {})", hlen, plen);
        return Err(NetError::Malformed);
    }

    match opcode {
        ARP_OP_REQUEST => input_request(pkt),
        ARP_OP_REPLY => input_reply(pkt),
        other => {
            crate::kprintln!("arp: received unknown message: {:#x}", other);
            Err(NetError::Malformed)
        }
    }
}

/// A request whose target protocol address is one of ours becomes the
/// reply, rewritten in place: hardware/protocol pairs swapped, our MAC and
/// the requested IP installed as the source.
fn input_request(mut pkt: Pkt) -> Result<(), NetError> {
    let target = {
        let (arp, _) = ArpPkt::ref_from_prefix(pkt.data()).map_err(|_| NetError::Malformed)?;
        u32::from_be_bytes(arp.tpa)
    };

    let ifindex = match eth::ip_owner(target) {
        Some(i) => i,
        None => return Ok(()), // not ours, drop silently
    };
    let our_mac = eth::if_mac(ifindex).ok_or(NetError::NoDevice)?;

    let dst = {
        let (arp, _) =
            ArpPkt::mut_from_prefix(pkt.data_mut()).map_err(|_| NetError::Malformed)?;

        arp.opcode = U16::new(ARP_OP_REPLY);
        arp.tha = arp.sha;
        arp.tpa = arp.spa;
        arp.sha = our_mac;
        arp.spa = target.to_be_bytes();
        arp.tha
    };

    // Send back out of the interface the request arrived on.
    let out_if = pkt.ifindex.unwrap_or(ifindex);
    eth::output(out_if, pkt, &dst, ETH_TYPE_ARP)
}

/// A reply populates the cache and, through the IP layer, releases any
/// datagrams parked on the resolution.
fn input_reply(pkt: Pkt) -> Result<(), NetError> {
    let (mac, ip) = {
        let (arp, _) = ArpPkt::ref_from_prefix(pkt.data()).map_err(|_| NetError::Malformed)?;
        (arp.sha, u32::from_be_bytes(arp.spa))
    };

    cache_insert(mac, ip);
    crate::ip::arp_resolved(ip);
    Ok(()) // pkt dropped here
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    ARP_CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::testdev::MockDriver;
    use crate::eth::BindState;
    use crate::testutil::kernel_lock;
    use alloc::boxed::Box;

    const LOCAL_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x01];
    const PEER_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x02];
    const LOCAL_IP: u32 = u32::from_be_bytes([192, 168, 0, 99]);
    const PEER_IP: u32 = u32::from_be_bytes([192, 168, 0, 2]);

    fn setup() -> (usize, std::sync::Arc<std::sync::Mutex<alloc::vec::Vec<Vec<u8>>>>) {
        crate::sched::reset_for_test();
        crate::sched::sched_init().unwrap();
        crate::eth::reset_for_test();
        reset_for_test();
        crate::ip::reset_for_test();

        let (drv, sent) = MockDriver::new();
        let ifindex = eth::register_if("test0", LOCAL_MAC, 39, Box::new(drv));
        eth::set_bound(ifindex, BindState::BoundNet);
        eth::add_ip(
            ifindex,
            crate::eth::IpDesc {
                addr: LOCAL_IP,
                netmask: 0xFFFF_FF00,
                broadcast: LOCAL_IP | 0xFF,
            },
        )
        .unwrap();
        (ifindex, sent)
    }

    fn request_for(tpa: [u8; 4]) -> ArpPkt {
        ArpPkt {
            htype: U16::new(ARP_HRD_ETHERNET),
            ptype: U16::new(ETH_TYPE_IPV4),
            hlen: 6,
            plen: 4,
            opcode: U16::new(ARP_OP_REQUEST),
            sha: PEER_MAC,
            spa: PEER_IP.to_be_bytes(),
            tha: [0; 6],
            tpa,
        }
    }

    #[test]
    fn request_for_local_ip_produces_reply() {
        let _g = kernel_lock();
        let (ifindex, sent) = setup();

        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(request_for(LOCAL_IP.to_be_bytes()).as_bytes())
            .unwrap();
        pkt.ifindex = Some(ifindex);

        input(pkt).unwrap();
        crate::eth::drain_for_test();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        // Unicast back to the requester, from our MAC.
        assert_eq!(&f[..6], &PEER_MAC);
        assert_eq!(&f[6..12], &LOCAL_MAC);

        let (arp, _) = ArpPkt::ref_from_prefix(&f[ETH_HLEN..]).unwrap();
        assert_eq!(arp.opcode.get(), ARP_OP_REPLY);
        assert_eq!(arp.sha, LOCAL_MAC);
        assert_eq!(arp.spa, LOCAL_IP.to_be_bytes());
        assert_eq!(arp.tha, PEER_MAC);
        assert_eq!(arp.tpa, PEER_IP.to_be_bytes());
    }

    #[test]
    fn request_for_foreign_ip_is_dropped() {
        let _g = kernel_lock();
        let (ifindex, sent) = setup();

        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(request_for([10, 0, 0, 1]).as_bytes()).unwrap();
        pkt.ifindex = Some(ifindex);

        input(pkt).unwrap();
        crate::eth::drain_for_test();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn reply_populates_cache_once() {
        let _g = kernel_lock();
        let (_ifindex, _) = setup();

        let mut reply = request_for(LOCAL_IP.to_be_bytes());
        reply.opcode = U16::new(ARP_OP_REPLY);

        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(reply.as_bytes()).unwrap();
        input(pkt).unwrap();

        assert_eq!(cache_lookup(PEER_IP), Some(PEER_MAC));

        // A duplicate reply with a different MAC does not displace the
        // original entry.
        let mut dup = request_for(LOCAL_IP.to_be_bytes());
        dup.opcode = U16::new(ARP_OP_REPLY);
        dup.sha = [0x02, 0, 0, 0, 0, 0x33];
        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(dup.as_bytes()).unwrap();
        input(pkt).unwrap();

        assert_eq!(cache_lookup(PEER_IP), Some(PEER_MAC));
        let mut n = 0;
        cache_snapshot(|_| n += 1);
        assert_eq!(n, 1);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        let _g = kernel_lock();
        let (_ifindex, _) = setup();

        // Truncated.
        let mut pkt = Pkt::alloc(8).unwrap();
        pkt.add_tail(&[0u8; 8]).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));

        // Wrong hardware type.
        let mut bad = request_for(LOCAL_IP.to_be_bytes());
        bad.htype = U16::new(6);
        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(bad.as_bytes()).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));

        // Wrong address sizes.
        let mut bad = request_for(LOCAL_IP.to_be_bytes());
        bad.hlen = 8;
        let mut pkt = Pkt::alloc(ARP_PKT_LEN).unwrap();
        pkt.add_tail(bad.as_bytes()).unwrap();
        assert_eq!(input(pkt), Err(NetError::Malformed));
    }

    #[test]
    fn outbound_request_is_broadcast() {
        let _g = kernel_lock();
        let (ifindex, sent) = setup();

        request(ifindex, PEER_IP).unwrap();
        crate::eth::drain_for_test();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(&f[..6], &MAC_BCAST);

        let (arp, _) = ArpPkt::ref_from_prefix(&f[ETH_HLEN..]).unwrap();
        assert_eq!(arp.opcode.get(), ARP_OP_REQUEST);
        assert_eq!(arp.sha, LOCAL_MAC);
        assert_eq!(arp.spa, LOCAL_IP.to_be_bytes());
        assert_eq!(arp.tha, MAC_BCAST);
        assert_eq!(arp.tpa, PEER_IP.to_be_bytes());
    }
}
