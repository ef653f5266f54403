//! UDP datagram input.
//!
//! Length-validated, checksum-verified delivery to a registered
//! higher-layer handler. A nonzero checksum is verified over the
//! pseudo-header; a zero checksum means the sender skipped it and the
//! datagram is accepted as-is. There is no transmit path at this layer.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::eth::NetError;
use crate::ip::{Ipv4Hdr, IP_PROTO_UDP};
use crate::pkt::{ocksum16_parts, Pkt};
use crate::sync::IrqMutex;

pub const UDP_HDR_LEN: usize = 8;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct UdpHdr {
    pub src_port: U16,
    pub dst_port: U16,
    pub len: U16,
    pub cksum: U16,
}

const_assert_eq!(core::mem::size_of::<UdpHdr>(), UDP_HDR_LEN);

/// A delivered datagram, borrowed for the duration of the handler call.
pub struct UdpDatagram<'a> {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

pub type UdpHandler = fn(&UdpDatagram);

static HANDLER: IrqMutex<Option<UdpHandler>> = IrqMutex::new(None);

/// Register the single upper-layer consumer. Datagrams arriving without a
/// handler are counted as delivered and freed.
pub fn set_handler(f: UdpHandler) {
    *HANDLER.lock() = Some(f);
}

/// Handle one datagram still carrying its IP header. Consumes the packet.
pub fn input(pkt: Pkt) -> Result<(), NetError> {
    let (ihl, ip_len, src_ip, dst_ip) = {
        let (ip, _) = Ipv4Hdr::ref_from_prefix(pkt.data()).map_err(|_| NetError::Malformed)?;
        (
            ip.ihl_bytes(),
            ip.len.get() as usize,
            ip.src.get(),
            ip.dst.get(),
        )
    };

    if pkt.len() < ihl + UDP_HDR_LEN {
        crate::kprintln!("udp: dropped truncated datagram ({} bytes)", pkt.len());
        return Err(NetError::Malformed);
    }

    let seg = &pkt.data()[ihl..];
    let (udp, _) = UdpHdr::ref_from_prefix(seg).map_err(|_| NetError::Malformed)?;
    let udp_len = udp.len.get() as usize;
    let cksum = udp.cksum.get();

    // The declared UDP length must agree with what IP delivered, and can
    // never reach past the bytes actually present.
    if udp_len < UDP_HDR_LEN
        || udp_len > seg.len()
        || (udp_len != ip_len.saturating_sub(ihl) && udp_len != pkt.len() - ihl)
    {
        crate::kprintln!("udp: dropped datagram with invalid length: {}", udp_len);
        return Err(NetError::Malformed);
    }

    // A sender that computed a checksum gets it verified; a zero field is
    // an explicit opt-out and is accepted.
    if cksum != 0 {
        let pseudo = pseudo_header(src_ip, dst_ip, udp_len as u16);
        let sum = ocksum16_parts(&[&pseudo, &seg[..udp_len]]);
        if sum != 0xFFFF {
            crate::kprintln!("udp: dropped datagram with bad cksum ({:#x})", sum);
            return Err(NetError::Malformed);
        }
    }

    let datagram = UdpDatagram {
        src_ip,
        dst_ip,
        src_port: udp.src_port.get(),
        dst_port: udp.dst_port.get(),
        payload: &seg[UDP_HDR_LEN..udp_len],
    };

    let handler = *HANDLER.lock();
    match handler {
        Some(f) => f(&datagram),
        None => crate::kprintln!(
            "udp: received datagram {} -> {}, len {}",
            datagram.src_port,
            datagram.dst_port,
            udp_len
        ),
    }

    Ok(()) // pkt freed here
}

fn pseudo_header(src: u32, dst: u32, udp_len: u16) -> [u8; 12] {
    let mut p = [0u8; 12];
    p[0..4].copy_from_slice(&src.to_be_bytes());
    p[4..8].copy_from_slice(&dst.to_be_bytes());
    p[9] = IP_PROTO_UDP;
    p[10..12].copy_from_slice(&udp_len.to_be_bytes());
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IP_HDR_LEN;
    use crate::pkt::ocksum16;
    use crate::testutil::kernel_lock;
    use alloc::vec::Vec;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PEER_IP: u32 = u32::from_be_bytes([192, 168, 0, 2]);
    const LOCAL_IP: u32 = u32::from_be_bytes([192, 168, 0, 99]);

    static DELIVERED: AtomicU32 = AtomicU32::new(0);

    fn counting_handler(d: &UdpDatagram) {
        assert_eq!(d.src_port, 4000);
        assert_eq!(d.dst_port, 7);
        DELIVERED.fetch_add(1, Ordering::SeqCst);
    }

    /// IP+UDP datagram from PEER:4000 to LOCAL:7. `checksummed` selects a
    /// real checksum or the all-zero opt-out.
    fn datagram(payload: &[u8], checksummed: bool) -> Pkt {
        let udp_len = UDP_HDR_LEN + payload.len();

        let mut udp = Vec::new();
        udp.extend_from_slice(
            UdpHdr {
                src_port: U16::new(4000),
                dst_port: U16::new(7),
                len: U16::new(udp_len as u16),
                cksum: U16::new(0),
            }
            .as_bytes(),
        );
        udp.extend_from_slice(payload);

        if checksummed {
            let pseudo = pseudo_header(PEER_IP, LOCAL_IP, udp_len as u16);
            let mut sum = !ocksum16_parts(&[&pseudo, &udp]);
            if sum == 0 {
                sum = 0xFFFF;
            }
            udp[6..8].copy_from_slice(&sum.to_be_bytes());
        }

        let mut ip = Ipv4Hdr {
            ver_ihl: 0x45,
            tos: 0,
            len: U16::new((IP_HDR_LEN + udp_len) as u16),
            id: U16::new(9),
            flags_frag: U16::new(0),
            ttl: 64,
            proto: IP_PROTO_UDP,
            cksum: U16::new(0),
            src: zerocopy::byteorder::network_endian::U32::new(PEER_IP),
            dst: zerocopy::byteorder::network_endian::U32::new(LOCAL_IP),
        };
        ip.cksum = U16::new(!ocksum16(ip.as_bytes()));

        let mut pkt = Pkt::alloc(IP_HDR_LEN + udp_len).unwrap();
        pkt.add_tail(ip.as_bytes()).unwrap();
        pkt.add_tail(&udp).unwrap();
        pkt
    }

    #[test]
    fn checksummed_datagram_is_delivered() {
        let _g = kernel_lock();
        set_handler(counting_handler);
        let before = DELIVERED.load(Ordering::SeqCst);

        input(datagram(b"echo me", true)).unwrap();
        assert_eq!(DELIVERED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn zero_checksum_is_accepted() {
        let _g = kernel_lock();
        set_handler(counting_handler);
        let before = DELIVERED.load(Ordering::SeqCst);

        input(datagram(b"no checksum", false)).unwrap();
        assert_eq!(DELIVERED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn corrupted_datagram_is_dropped() {
        let _g = kernel_lock();
        set_handler(counting_handler);
        let before = DELIVERED.load(Ordering::SeqCst);

        let mut pkt = datagram(b"garble", true);
        let len = pkt.len();
        pkt.data_mut()[len - 1] ^= 0x01;

        assert!(input(pkt).is_err());
        assert_eq!(DELIVERED.load(Ordering::SeqCst), before);
    }

    #[test]
    fn length_mismatch_is_dropped() {
        let _g = kernel_lock();
        set_handler(counting_handler);
        let before = DELIVERED.load(Ordering::SeqCst);

        let mut pkt = datagram(b"shrunk", false);
        // Declare a UDP length that matches neither the IP length nor the
        // packet.
        pkt.data_mut()[IP_HDR_LEN + 4..IP_HDR_LEN + 6].copy_from_slice(&99u16.to_be_bytes());

        assert!(input(pkt).is_err());
        assert_eq!(DELIVERED.load(Ordering::SeqCst), before);
    }

    #[test]
    fn odd_length_payload_checksums_correctly() {
        let _g = kernel_lock();
        set_handler(counting_handler);
        let before = DELIVERED.load(Ordering::SeqCst);

        input(datagram(b"odd", true)).unwrap();
        assert_eq!(DELIVERED.load(Ordering::SeqCst), before + 1);
    }
}
