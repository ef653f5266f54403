//! ICMP: echo service and reply logging.
//!
//! Echo requests are rewritten into replies in the received buffer and
//! handed back to IP output; everything else is logged and dropped.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::eth::NetError;
use crate::ip::{Ipv4Hdr, IP_PROTO_ICMP};
use crate::pkt::{ocksum16, Pkt};

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO: u8 = 8;

pub const ICMP_HDR_LEN: usize = 8;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IcmpHdr {
    pub typ: u8,
    pub code: u8,
    pub cksum: U16,
    pub id: U16,
    pub seqnum: U16,
}

const_assert_eq!(core::mem::size_of::<IcmpHdr>(), ICMP_HDR_LEN);

/// Handle one ICMP message still carrying its IP header. Consumes the
/// packet unless it moves on to output.
pub fn input(mut pkt: Pkt) -> Result<(), NetError> {
    let (ihl, src) = {
        let (ip, _) = Ipv4Hdr::ref_from_prefix(pkt.data()).map_err(|_| NetError::Malformed)?;
        (ip.ihl_bytes(), ip.src.get())
    };

    if pkt.len() < ihl + ICMP_HDR_LEN {
        crate::kprintln!("icmp: dropped truncated message ({} bytes)", pkt.len());
        return Err(NetError::Malformed);
    }

    // The ICMP checksum covers everything after the IP header.
    let sum = ocksum16(&pkt.data()[ihl..]);
    if sum != 0xFFFF {
        crate::kprintln!("icmp: dropped packet with bad cksum ({:#x})", sum);
        return Err(NetError::Malformed);
    }

    let typ = pkt.data()[ihl];
    match typ {
        ICMP_TYPE_ECHO => {
            // Rewrite in place: flip the type, recompute the checksum over
            // the body, strip the IP header and re-emit toward the sender.
            {
                let body = &mut pkt.data_mut()[ihl..];
                let (icmp, _) =
                    IcmpHdr::mut_from_prefix(body).map_err(|_| NetError::Malformed)?;
                icmp.typ = ICMP_TYPE_ECHO_REPLY;
                icmp.cksum = U16::new(0);
            }
            let sum = !ocksum16(&pkt.data()[ihl..]);
            {
                let body = &mut pkt.data_mut()[ihl..];
                let (icmp, _) =
                    IcmpHdr::mut_from_prefix(body).map_err(|_| NetError::Malformed)?;
                icmp.cksum = U16::new(sum);
            }

            pkt.del_head(ihl).map_err(|_| NetError::Malformed)?;
            crate::ip::output(pkt, src, IP_PROTO_ICMP)
        }

        ICMP_TYPE_ECHO_REPLY => {
            let (_, rest) = Ipv4Hdr::ref_from_prefix(pkt.data()).map_err(|_| NetError::Malformed)?;
            if let Ok((icmp, _)) = IcmpHdr::ref_from_prefix(rest) {
                crate::kprintln!(
                    "icmp: received echo reply {:#x} {:#x}",
                    icmp.id.get(),
                    icmp.seqnum.get()
                );
            }
            Ok(()) // drop
        }

        other => {
            crate::kprintln!("icmp: received unknown message: {:#x}", other);
            Ok(()) // drop
        }
    }
}
