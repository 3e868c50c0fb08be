use crate::tcp::Quad;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("send on {0:?} after its write half was closed")]
    SendAfterClose(Quad),

    #[error("{0:?} has already been closed")]
    AlreadyClosed(Quad),
}
