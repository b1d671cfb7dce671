//! Connection finite-state machine (FSM) types.
//!
//! bTCP is asymmetric: the client only ever sends data and the server only
//! ever receives it, so each role has its own, much smaller, state diagram.
//! Transitions live in [`crate::client`] and [`crate::server`].

/// Client lifecycle.
///
/// ```text
///  IDLE ──connect──▶ SYN_SENT ──SYN|ACK──▶ ESTABLISHED ──disconnect──▶ FIN_SENT
///    ▲                  │                                                 │
///    └── retries spent ─┘                        ACK|FIN or retries spent │
///                                                                         ▼
///                                                                      CLOSED
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientState {
    /// Fresh or cleaned socket; no handshake in progress.
    #[default]
    Idle,
    /// SYN sent; waiting for the matching SYN|ACK.
    SynSent,
    /// Handshake complete; `send` is allowed.
    Established,
    /// FIN sent; waiting for ACK|FIN.
    FinSent,
    /// Torn down (confirmed by the peer or forced locally).
    Closed,
}

/// Server lifecycle.
///
/// ```text
///  CLOSED ──accept──▶ LISTEN ──SYN──▶ SYN_RECEIVED ──ACK──▶ ESTABLISHED
///    ▲                                                          │
///    └───────────────────────────── FIN ────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerState {
    #[default]
    Closed,
    /// Waiting for a client's SYN.
    Listen,
    /// SYN|ACK sent; waiting for the final ACK of the handshake.
    SynReceived,
    Established,
}

impl ClientState {
    /// `true` in the states where the peer considers us connected.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Established | Self::FinSent)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
