use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;

use etherparse::TcpHeaderSlice;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::net::{Clock, Network, SystemClock};

use super::{wire, Action, Connection, Dual, Quad};

// A passive endpoint bound to one local port. The host routes every
// ingress segment into `deliver` and calls `poll` from its event loop.
pub struct Listener {
    net: Rc<dyn Network>,
    clock: Rc<dyn Clock>,
    port: u16,
    mss: usize,
    rng: SmallRng,
    pub(crate) conns: HashMap<Quad, Connection>,
    on_accept: Option<Box<dyn FnMut(&Connection)>>,
}

impl Listener {
    pub fn new(net: Rc<dyn Network>, port: u16) -> Self {
        Self::with_parts(
            net,
            port,
            Rc::new(SystemClock),
            SmallRng::from_entropy(),
            wire::MSS,
        )
    }

    // `new` with the clock, the ISS generator, and the payload cap
    // injected.
    pub fn with_parts(
        net: Rc<dyn Network>,
        port: u16,
        clock: Rc<dyn Clock>,
        rng: SmallRng,
        mss: usize,
    ) -> Self {
        Listener {
            net,
            clock,
            port,
            mss,
            rng,
            conns: HashMap::new(),
            on_accept: None,
        }
    }

    // Called synchronously once per newly established connection.
    pub fn on_accept(&mut self, callback: impl FnMut(&Connection) + 'static) {
        self.on_accept = Some(Box::new(callback));
    }

    pub fn deliver(&mut self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, segment: &[u8]) {
        let Ok(tcph) = TcpHeaderSlice::from_slice(segment) else {
            tracing::debug!("dropping unparseable segment");
            return;
        };

        // Segments for other ports are not ours to answer.
        if tcph.destination_port() != self.port {
            return;
        }

        if !self.net.ignore_checksum() && !wire::checksum_ok(segment, src_addr, dst_addr) {
            tracing::warn!("dropping segment with invalid checksum");
            return;
        }

        let payload = &segment[tcph.data_offset() as usize * 4..];

        let quad = Quad {
            src: Dual {
                ipv4: src_addr,
                port: tcph.source_port(),
            },
            dst: Dual {
                ipv4: dst_addr,
                port: tcph.destination_port(),
            },
        };

        if tcph.syn() && !self.conns.contains_key(&quad) {
            self.open(quad, tcph.sequence_number());
            return;
        }

        let Some(conn) = self.conns.get(&quad).cloned() else {
            tracing::warn!(?quad, "segment for unknown connection");
            return;
        };

        let action = conn.on_segment(
            tcph.sequence_number(),
            tcph.acknowledgment_number(),
            tcph.syn(),
            tcph.ack(),
            tcph.fin(),
            payload,
        );

        if action == Action::DeleteTcb {
            tracing::info!(?quad, "connection closed");
            self.conns.remove(&quad);
        }
    }

    // Timer expiry runs here, serialized with segment processing.
    pub fn poll(&mut self) {
        for conn in self.conns.values() {
            conn.on_tick();
        }
    }

    // Passive open. Any payload on the SYN is ignored.
    fn open(&mut self, quad: Quad, peer_seq: u32) {
        let iss = self.rng.gen_range(0..0x1_0000u32);
        let ack_no = peer_seq.wrapping_add(1);

        wire::write_segment(&*self.net, quad, iss, ack_no, true, false, true, &[]);

        let conn = Connection::new(
            quad,
            Rc::clone(&self.net),
            Rc::clone(&self.clock),
            self.mss,
            iss,
            peer_seq,
        );

        self.conns.insert(quad, conn.clone());
        tracing::info!(?quad, iss, ack_no, "new connection, SYN+ACK sent");

        if let Some(callback) = self.on_accept.as_mut() {
            callback(&conn);
        }
    }
}
