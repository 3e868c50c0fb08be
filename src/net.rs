use std::net::Ipv4Addr;
use std::time::Instant;

/*
The datagram layer below the transport. It carries whole segments to a
next-hop address and may lose or duplicate them, but it does not
fragment or reorder. The transport hands fully-formed, checksum-valid
segments to `send`; ingress flows the other way, with the host binding
`Listener::deliver` as the network's receive callback.
*/
pub trait Network {
    fn send(&self, segment: &[u8], next_hop: Ipv4Addr);

    // Test harnesses that synthesize segments without valid checksums
    // set this to make the listener skip verification.
    fn ignore_checksum(&self) -> bool {
        false
    }
}

// Time source for RTT sampling and retransmission deadlines. Injected so
// tests can advance time by hand.
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
