use std::net::Ipv4Addr;

use etherparse::{TcpHeader, TcpHeaderSlice};

use crate::net::Network;

use super::{Dual, Quad};

// Fixed payload cap per segment.
pub const MSS: usize = 1460;

// Window advertised in every outgoing header. Receiver-driven flow
// control is not part of this stack, so peers always see a constant
// window.
const WINDOW: u16 = 64240;

// Build a segment from `from` to `to`: a 20-byte header with no options
// and the checksum computed over the pseudo-header and payload.
pub fn make_segment(
    from: Dual,
    to: Dual,
    seq: u32,
    ack_no: u32,
    syn: bool,
    fin: bool,
    ack: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcph = TcpHeader::new(from.port, to.port, seq, WINDOW);

    tcph.syn = syn;
    tcph.fin = fin;
    tcph.ack = ack;
    tcph.acknowledgment_number = ack_no;
    tcph.checksum = tcph
        .calc_checksum_ipv4_raw(from.ipv4.octets(), to.ipv4.octets(), payload)
        .unwrap();

    let mut segment = Vec::with_capacity(tcph.header_len() as usize + payload.len());
    tcph.write(&mut segment).unwrap();
    segment.extend_from_slice(payload);

    segment
}

// Recompute the checksum of a received segment and compare it against
// the stored field. The recomputation spans the whole header, so
// segments carrying options verify too.
pub fn checksum_ok(segment: &[u8], src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> bool {
    let Ok(tcph) = TcpHeaderSlice::from_slice(segment) else {
        return false;
    };
    let payload = &segment[tcph.data_offset() as usize * 4..];

    tcph.to_header()
        .calc_checksum_ipv4_raw(src_addr.octets(), dst_addr.octets(), payload)
        .map(|expected| expected == tcph.checksum())
        .unwrap_or(false)
}

// Build and transmit a segment toward the peer side of `quad`.
pub(crate) fn write_segment(
    net: &dyn Network,
    quad: Quad,
    seq: u32,
    ack_no: u32,
    syn: bool,
    fin: bool,
    ack: bool,
    payload: &[u8],
) {
    let segment = make_segment(quad.dst, quad.src, seq, ack_no, syn, fin, ack, payload);

    net.send(&segment, quad.src.ipv4);
}
