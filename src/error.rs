use std::time::Duration;

use thiserror::Error;

use crate::link::PeerAddress;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial: {0}")]
    Serial(#[from] serialport::Error),
    #[error("peer {0} is not registered")]
    UnknownPeer(PeerAddress),
    #[error("frame of {len} bytes exceeds link mtu {mtu}")]
    TooLarge { len: usize, mtu: usize },
    #[error("link not started")]
    NotStarted,
    #[error("link closed")]
    Closed,
    #[error("injected send failure")]
    Injected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("send failed: {0}")]
    LinkSendFailure(#[source] LinkError),
    #[error("no handshake ack after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },
    #[error("send completion not signalled within {0:?}")]
    SendStall(Duration),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("link setup: {0}")]
    Setup(#[source] LinkError),
}
