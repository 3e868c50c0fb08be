mod err;
pub use err::*;

mod net;
pub use net::{Clock, Network, SystemClock};

mod tcp;
pub use tcp::{wire, Connection, Dual, Listener, Quad};
