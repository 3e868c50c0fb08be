use std::net::Ipv4Addr;

mod conn;
mod listen;
pub mod wire;

pub use conn::*;
pub use listen::*;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

// Connection identity. `src` is the peer endpoint as it appears in the
// source fields of an incoming segment, `dst` the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

/*
Passive-only endpoint, so the state space collapses to:

                 +--------+
                 | LISTEN |  (conceptual; lives in the Listener)
                 +--------+
                     |  rcv SYN
                     |  snd SYN,ACK
                     V
                +---------+
                |  ESTAB  |
                +---------+
       rcv FIN   |       |   close()
       snd ACK   |       |   snd FIN
                 V       V
                +---------+
                | CLOSING |
                +---------+
                     |  FIN acked (local close)
                     |  or pipe drained (remote close)
                     V
                +---------+
                | CLOSED  |  (entry removed by the Listener)
                +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Estab,
    Closing,
    Closed,
}

// What the owner of the connection table should do with the entry after
// a segment has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Noop,
    DeleteTcb,
}

pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".  To
    //     insure that new data is never mistakenly considered old and vice-
    //     versa, the left edge of the sender's window has to be at most
    //     2**31 away from the right edge of the receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

pub(crate) fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}
