//! Datagram transport port.
//!
//! A [`Port`] binds one local endpoint to one fixed remote endpoint and moves
//! raw segment bytes between them without any ordering or delivery
//! guarantee.  All protocol logic lives elsewhere; this module owns only
//! byte I/O.
//!
//! Arrivals are not pushed through a callback.  Background tasks forward
//! every received datagram into a channel and the owning event loop pulls
//! them with [`Port::recv_segment`].  Sending is a non-blocking enqueue.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::simulator::{Simulator, SimulatorConfig};

/// Maximum UDP payload size (theoretical limit; segments are far smaller).
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The port (or its peer, for in-memory ports) has been destroyed.
    #[error("port is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// One end of an unreliable point-to-point datagram channel.
#[derive(Debug)]
pub struct Port {
    local_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Port {
    /// Bind a UDP socket to `local` and restrict it to the peer at `remote`.
    ///
    /// Passing port `0` in `local` lets the OS choose an ephemeral port.
    pub async fn udp(local: SocketAddr, remote: SocketAddr) -> Result<Self, PortError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer = {
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                while let Some(bytes) = out_rx.recv().await {
                    if let Err(e) = socket.send(&bytes).await {
                        log::debug!("[port] send to {remote} failed: {e}");
                    }
                }
            })
        };

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        if in_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // An ICMP "port unreachable" from a peer that is not up
                    // yet surfaces here; the peer may still appear later.
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionRefused
                                | std::io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        log::debug!("[port] peer {remote} unreachable: {e}");
                    }
                    Err(e) => {
                        log::warn!("[port] receive loop stopped: {e}");
                        break;
                    }
                }
            }
        });

        log::debug!("[port] bound {local_addr} ↔ {remote}");
        Ok(Self {
            local_addr: Some(local_addr),
            outbound: out_tx,
            inbound: in_rx,
            tasks: vec![writer, reader],
        })
    }

    /// Two in-memory ports wired back to back.  Delivery is perfect.
    pub fn pair() -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::memory(a_tx, a_rx, Vec::new()), Self::memory(b_tx, b_rx, Vec::new()))
    }

    /// Two in-memory ports whose links run through fault-injecting
    /// [`Simulator`]s, one per direction.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair_with(a_to_b: SimulatorConfig, b_to_a: SimulatorConfig) -> (Port, Port) {
        let (a_tx, a_out) = mpsc::unbounded_channel();
        let (b_tx, b_out) = mpsc::unbounded_channel();
        let (a_in, a_rx) = mpsc::unbounded_channel();
        let (b_in, b_rx) = mpsc::unbounded_channel();

        let ab = tokio::spawn(Simulator::new(a_to_b).run(a_out, b_in));
        let ba = tokio::spawn(Simulator::new(b_to_a).run(b_out, a_in));

        (
            Self::memory(a_tx, a_rx, vec![ab]),
            Self::memory(b_tx, b_rx, vec![ba]),
        )
    }

    fn memory(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            local_addr: None,
            outbound,
            inbound,
            tasks,
        }
    }

    /// Address this port is bound to; `None` for in-memory ports.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queue one encoded segment for transmission to the peer.
    pub fn send_segment(&self, bytes: Vec<u8>) -> Result<(), PortError> {
        self.outbound.send(bytes).map_err(|_| PortError::Closed)
    }

    /// Wait for the next datagram from the peer.
    ///
    /// Returns `None` once the port can never deliver again.
    pub async fn recv_segment(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Release the endpoint binding and stop the background tasks.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
