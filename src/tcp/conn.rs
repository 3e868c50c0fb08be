use std::cell::RefCell;
use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::net::{Clock, Network};
use crate::Error;

use super::{is_between_wrapped, wire, wrapping_lt, Action, Quad, State};

// RTO before the first sample; the clamp bounds apply to every
// recomputation thereafter.
pub(crate) const INITIAL_RTO: Duration = Duration::from_millis(500);
pub(crate) const MIN_RTO: Duration = Duration::from_millis(50);
pub(crate) const MAX_RTO: Duration = Duration::from_secs(4);

type Receiver = Box<dyn FnMut(&Connection, &[u8])>;

// Clones share the engine: the listener keeps one handle in its table and
// the application receives another through the accept callback.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

pub(crate) struct Inner {
    pub(crate) quad: Quad,
    net: Rc<dyn Network>,
    clock: Rc<dyn Clock>,
    mss: usize,

    receiver: Option<Receiver>,

    pub(crate) state: State,
    iss: u32, // kept so a retransmitted SYN gets the original SYN+ACK back
    irs: u32,
    pub(crate) fin_seq: Option<u32>, // sequence number our FIN went out with

    pub(crate) send_base: u32,
    pub(crate) send_next: u32,
    pub(crate) recv_next: u32,

    // unacked.len() == send_next - send_base at all times
    pub(crate) unacked: VecDeque<u8>,
    pub(crate) unsent: VecDeque<u8>,

    pub(crate) bytes_acked: usize, // every full MSS here buys one cwnd increment
    pub(crate) cwnd: u32,          // in MSS units, never below 1

    pub(crate) srtt: f64,
    pub(crate) rttvar: f64,
    pub(crate) rto: Duration,
    rtt_measured: bool,
    // set when a segment enters an empty pipe, cleared while a
    // retransmission is in flight (Karn's rule)
    pub(crate) sample_start: Option<Instant>,
    pub(crate) retransmitting: bool,
    pub(crate) timer: Option<Instant>, // armed iff unacked is non-empty
}

impl Connection {
    pub(crate) fn new(
        quad: Quad,
        net: Rc<dyn Network>,
        clock: Rc<dyn Clock>,
        mss: usize,
        iss: u32,
        irs: u32,
    ) -> Self {
        Connection {
            inner: Rc::new(RefCell::new(Inner {
                quad,
                net,
                clock,
                mss,
                receiver: None,
                state: State::Estab,
                iss,
                irs,
                fin_seq: None,
                send_base: iss.wrapping_add(1),
                send_next: iss.wrapping_add(1),
                recv_next: irs.wrapping_add(1),
                unacked: VecDeque::new(),
                unsent: VecDeque::new(),
                bytes_acked: 0,
                cwnd: 1,
                srtt: 0.0,
                rttvar: 0.0,
                rto: INITIAL_RTO,
                rtt_measured: false,
                sample_start: None,
                retransmitting: false,
                timer: None,
            })),
        }
    }

    // The callback gets each in-order payload, and once empty bytes when
    // the peer closes. Reentrant send/close from inside it is fine.
    pub fn set_receiver(&self, callback: impl FnMut(&Connection, &[u8]) + 'static) {
        self.inner.borrow_mut().receiver = Some(Box::new(callback));
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if inner.fin_seq.is_some() || inner.state == State::Closed {
            return Err(Error::SendAfterClose(inner.quad));
        }

        inner.unsent.extend(bytes);

        let now = inner.clock.now();
        inner.transmit_pending(now);

        Ok(())
    }

    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();

        if inner.fin_seq.is_some() || inner.state == State::Closed {
            return Err(Error::AlreadyClosed(inner.quad));
        }

        inner.fin_seq = Some(inner.send_next);
        inner.state = State::Closing;

        wire::write_segment(
            &*inner.net,
            inner.quad,
            inner.send_next,
            inner.recv_next,
            false,
            true,
            true,
            &[],
        );

        Ok(())
    }

    pub fn quad(&self) -> Quad {
        self.inner.borrow().quad
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner.borrow().state != State::Estab
    }

    // ACK is handled first, then FIN, then payload.
    pub(crate) fn on_segment(
        &self,
        seq: u32,
        ackno: u32,
        syn: bool,
        ack: bool,
        fin: bool,
        payload: &[u8],
    ) -> Action {
        let mut inner = self.inner.borrow_mut();

        // A SYN on a live connection is the peer retrying a handshake
        // whose SYN+ACK was lost. Answer with the original SYN+ACK and
        // leave all state alone.
        if syn {
            let (iss, first) = (inner.iss, inner.irs.wrapping_add(1));
            tracing::debug!(quad = ?inner.quad, "retransmitted SYN, repeating SYN+ACK");
            wire::write_segment(&*inner.net, inner.quad, iss, first, true, false, true, &[]);
            return Action::Noop;
        }

        // Data that is not the next expected byte is dropped whole; the
        // peer's retransmission timer recovers the gap.
        if !payload.is_empty() && seq != inner.recv_next {
            tracing::debug!(seq, recv_next = inner.recv_next, "dropping out-of-order data");
            return Action::Noop;
        }

        if ack {
            inner.handle_ack(ackno);

            if inner.state == State::Closing && inner.fin_acked_by(ackno) {
                inner.state = State::Closed;
                return Action::DeleteTcb;
            }
        }

        if fin {
            if inner.state != State::Estab {
                // Retransmitted FIN; the teardown above settles it.
                return Action::Noop;
            }

            inner.state = State::Closing;
            inner.recv_next = inner.recv_next.wrapping_add(1); // the FIN octet
            tracing::info!(quad = ?inner.quad, "peer closed");

            drop(inner);
            self.notify_receiver(&[]);
            self.emit_ack();
            return Action::Noop;
        }

        if !payload.is_empty() {
            inner.recv_next = inner.recv_next.wrapping_add(payload.len() as u32);

            drop(inner);
            self.notify_receiver(payload);
            // Acknowledge before any further ingress is processed.
            self.emit_ack();
        }

        Action::Noop
    }

    pub(crate) fn on_tick(&self) {
        let mut inner = self.inner.borrow_mut();
        let now = inner.clock.now();

        let Some(deadline) = inner.timer else { return };
        if now < deadline {
            return;
        }

        // Timeout: halve the window, resend the oldest outstanding
        // segment, re-arm. The retransmission never yields an RTT sample.
        inner.cwnd = cmp::max(1, inner.cwnd / 2);
        inner.retransmitting = true;
        inner.sample_start = None;

        let len = cmp::min(inner.mss, inner.unacked.len());
        let data: Vec<u8> = inner.unacked.iter().copied().take(len).collect();

        tracing::warn!(quad = ?inner.quad, cwnd = inner.cwnd, len, "retransmission timeout");
        wire::write_segment(
            &*inner.net,
            inner.quad,
            inner.send_base,
            inner.recv_next,
            false,
            false,
            true,
            &data,
        );

        inner.timer = Some(now + inner.rto);
    }

    fn emit_ack(&self) {
        let inner = self.inner.borrow();
        wire::write_segment(
            &*inner.net,
            inner.quad,
            inner.send_next,
            inner.recv_next,
            false,
            false,
            true,
            &[],
        );
    }

    // Take the callback out and drop the borrow first, so the callback
    // may reenter send or close.
    fn notify_receiver(&self, bytes: &[u8]) {
        let callback = self.inner.borrow_mut().receiver.take();

        let Some(mut callback) = callback else { return };
        callback(self, bytes);

        let mut inner = self.inner.borrow_mut();
        if inner.receiver.is_none() {
            inner.receiver = Some(callback);
        }
    }
}

impl Inner {
    fn handle_ack(&mut self, ackno: u32) {
        if is_between_wrapped(self.send_base, ackno, self.send_next.wrapping_add(1)) {
            let now = self.clock.now();
            let acked = ackno.wrapping_sub(self.send_base) as usize;

            self.unacked.drain(..acked);
            self.send_base = ackno;
            self.bytes_acked += acked;
            tracing::debug!(acked, send_base = self.send_base, "cumulative ACK");

            if self.retransmitting {
                // Karn's rule: this could acknowledge the original or the
                // retransmission; no sample either way.
                self.retransmitting = false;
            } else if let Some(start) = self.sample_start.take() {
                self.update_rto(now.duration_since(start));
            }

            self.timer = if self.unacked.is_empty() {
                None
            } else {
                Some(now + self.rto)
            };

            while self.bytes_acked >= self.mss {
                self.bytes_acked -= self.mss;
                self.cwnd += 1;
                tracing::debug!(cwnd = self.cwnd, "window grew");
            }

            self.transmit_pending(now);
        } else if wrapping_lt(self.send_next, ackno) {
            // An ACK of our FIN lands one past send_next, since the FIN
            // octet never enters the send buffer. That one is expected.
            let acks_fin = matches!(self.fin_seq, Some(fin) if wrapping_lt(fin, ackno));
            if !acks_fin {
                tracing::debug!(ackno, send_next = self.send_next, "ACK beyond send_next, ignoring");
            }
        }
        // ack <= send_base: duplicate ACK, ignored. No fast retransmit.
    }

    // Move bytes from unsent into the pipe, one MSS-sized segment at a
    // time, while the window has room.
    fn transmit_pending(&mut self, now: Instant) {
        loop {
            let in_flight = self.unacked.len();
            let budget = (self.cwnd as usize * self.mss).saturating_sub(in_flight);

            if budget == 0 || self.unsent.is_empty() {
                return;
            }

            let len = cmp::min(cmp::min(budget, self.mss), self.unsent.len());
            let payload: Vec<u8> = self.unsent.drain(..len).collect();

            wire::write_segment(
                &*self.net,
                self.quad,
                self.send_next,
                self.recv_next,
                false,
                false,
                true,
                &payload,
            );

            self.unacked.extend(payload.iter());
            self.send_next = self.send_next.wrapping_add(len as u32);
            tracing::debug!(len, send_next = self.send_next, "data segment sent");

            if self.sample_start.is_none() && !self.retransmitting {
                self.sample_start = Some(now);
            }
            if self.timer.is_none() {
                self.timer = Some(now + self.rto);
            }
        }
    }

    // Teardown test, checked on every ACK while closing: with a local FIN
    // outstanding the peer must cover its sequence number; after a remote
    // FIN the pipe only needs to drain.
    fn fin_acked_by(&self, ackno: u32) -> bool {
        match self.fin_seq {
            Some(fin) => wrapping_lt(fin, ackno),
            None => self.unacked.is_empty(),
        }
    }

    /*
    -   When the first RTT measurement R is made, the host MUST set

            SRTT <- R
            RTTVAR <- R/2

    -   When a subsequent RTT measurement R' is made, a host MUST set

            RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
            SRTT <- (1 - alpha) * SRTT + alpha * R'

        The value of SRTT used in the update to RTTVAR is its value
        before updating SRTT itself using the second assignment.

        The above SHOULD be computed using alpha=1/8 and beta=1/4.

    -   After the computation, a host MUST update

            RTO <- SRTT + max (G, K*RTTVAR)   where K = 4.
    */
    fn update_rto(&mut self, sample: Duration) {
        const ALPHA: f64 = 0.125;
        const BETA: f64 = 0.25;

        let r = sample.as_secs_f64();

        if !self.rtt_measured {
            self.srtt = r;
            self.rttvar = r / 2.0;
            self.rtt_measured = true;
        } else {
            self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (self.srtt - r).abs();
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * r;
        }

        self.rto = Duration::from_secs_f64(self.srtt + 4.0 * self.rttvar).clamp(MIN_RTO, MAX_RTO);
        tracing::debug!(rto_ms = self.rto.as_millis() as u64, "RTO updated");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Connection")
            .field("quad", &inner.quad)
            .field("state", &inner.state)
            .field("send_base", &inner.send_base)
            .field("send_next", &inner.send_next)
            .field("recv_next", &inner.recv_next)
            .field("cwnd", &inner.cwnd)
            .finish()
    }
}
