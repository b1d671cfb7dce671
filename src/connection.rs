//! Pieces shared by the client and server connection state machines.
//!
//! - [`ConnError`], the error type of every socket operation.
//! - [`Inbound`], the classification of a received segment by flag pattern,
//!   which decides whether it feeds the handshake logic or the
//!   selective-repeat sender/receiver.
//! - Small helpers to put a [`Segment`] on a [`Port`] and to decode inbound
//!   datagrams, logging whatever has to be dropped.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::port::{Port, PortError};
use crate::segment::{Flags, Segment, SegmentError};

/// Reply channel for one command sent from a socket handle to its event loop.
pub(crate) type Reply<T> = oneshot::Sender<Result<T, ConnError>>;

// ---------------------------------------------------------------------------
// ConnError
// ---------------------------------------------------------------------------

/// Errors returned by the socket API.
///
/// None of them is fatal to the process; the socket stays usable (after
/// `clean`, if needed) unless it was closed.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("not connected")]
    NotConnected,
    #[error("operation not allowed in state {0}")]
    BadState(String),
    #[error("no SYN|ACK after {attempts} SYN attempts")]
    HandshakeTimedOut { attempts: u32 },
    #[error("no ACK|FIN after {attempts} FIN attempts; closed locally")]
    TeardownTimedOut { attempts: u32 },
    /// The peer tore the connection down and no more data is pending.
    #[error("peer closed the connection")]
    Eof,
    /// The socket was closed locally.
    #[error("socket is closed")]
    Closed,
    /// A newer request replaced this one before it completed.
    #[error("superseded by a newer request")]
    Superseded,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A received segment, classified by its flag pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// `{SYN}`: handshake step 1.
    Syn,
    /// `{SYN, ACK}`: handshake step 2.
    SynAck,
    /// `{ACK}`: handshake step 3, or a selective data ACK.
    Ack,
    /// `{FIN}`: teardown request.
    Fin,
    /// `{ACK, FIN}`: teardown confirmation.
    FinAck,
    /// No flags: data segment.
    Data,
    /// Any combination the protocol never sends.
    Unexpected,
}

impl Inbound {
    pub fn classify(f: Flags) -> Self {
        match (f.ack, f.syn, f.fin) {
            (false, true, false) => Inbound::Syn,
            (true, true, false) => Inbound::SynAck,
            (true, false, false) => Inbound::Ack,
            (false, false, true) => Inbound::Fin,
            (true, false, true) => Inbound::FinAck,
            (false, false, false) => Inbound::Data,
            _ => Inbound::Unexpected,
        }
    }
}

/// Decode an inbound datagram, logging and discarding malformed ones.
pub(crate) fn decode_inbound(role: &str, bytes: &[u8]) -> Option<Segment> {
    match Segment::decode(bytes) {
        Ok(seg) => Some(seg),
        Err(e) => {
            log::warn!("[{role}] dropping malformed segment: {e}");
            None
        }
    }
}

/// Encode `seg` and queue it on `port`.
pub(crate) fn transmit(port: &Port, seg: &Segment) -> Result<(), ConnError> {
    let bytes = seg.encode()?;
    port.send_segment(bytes)?;
    Ok(())
}

/// Complete a parked request, ignoring a caller that stopped waiting.
pub(crate) fn complete<T>(reply: Reply<T>, result: Result<T, ConnError>) {
    let _ = reply.send(result);
}
