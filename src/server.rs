//! Server side of a bTCP connection.
//!
//! Same shape as [`crate::client`]: a [`ServerSocket`] handle forwards
//! commands to an event loop that owns the [`SrReceiver`] and the port.  The
//! server never retransmits anything on its own, so its loop has no timer;
//! every action is a reaction to an inbound segment or a command.
//!
//! Received bytes are buffered by the loop as soon as they arrive, whether or
//! not the application is currently inside [`ServerSocket::recv`].

use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{complete, decode_inbound, transmit, ConnError, Inbound, Reply};
use crate::port::{Port, PortError};
use crate::segment::{Flags, Segment};
use crate::sr_receiver::{Receipt, SrReceiver};
use crate::state::ServerState;

enum Command {
    Accept(Reply<()>),
    Recv(Reply<Vec<u8>>),
    Clean(Reply<()>),
    State(Reply<ServerState>),
    Close(Reply<()>),
}

/// A bTCP server socket serving one client at a time.
pub struct ServerSocket {
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ServerSocket {
    /// Wrap an existing port.  Spawns the event loop on the current runtime.
    pub fn new(port: Port, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let local_addr = port.local_addr();
        let (commands, rx) = mpsc::channel(16);
        let conn = ServerConnection::new(port, config);
        let task = tokio::spawn(conn.run(rx));
        Ok(Self {
            commands,
            task: Some(task),
            local_addr,
        })
    }

    /// Bind a UDP port at `local` serving the client at `remote`.
    pub async fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        config: Config,
    ) -> Result<Self, ConnError> {
        let port = Port::udp(local, remote).await?;
        Self::new(port, config)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start listening and wait until a client completes the handshake.
    pub async fn accept(&mut self) -> Result<(), ConnError> {
        self.request(Command::Accept).await
    }

    /// Wait until at least one in-order byte is available and return every
    /// byte delivered so far.
    ///
    /// Returns [`ConnError::Eof`] once the client disconnected and nothing
    /// is left to deliver.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ConnError> {
        self.request(Command::Recv).await
    }

    /// [`recv`](Self::recv), writing the bytes into `dst`.  Returns the
    /// number of bytes written.
    pub async fn recv_into<W>(&mut self, dst: &mut W) -> Result<usize, ConnError>
    where
        W: AsyncWrite + Unpin,
    {
        let data = self.recv().await?;
        dst.write_all(&data).await?;
        Ok(data.len())
    }

    /// Receive until the client disconnects.
    pub async fn recv_to_end(&mut self) -> Result<Vec<u8>, ConnError> {
        let mut out = Vec::new();
        loop {
            match self.recv().await {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(ConnError::Eof) => return Ok(out),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reset the connection to its initial values; the port stays bound.
    pub async fn clean(&mut self) -> Result<(), ConnError> {
        self.request(Command::Clean).await
    }

    pub async fn state(&self) -> Result<ServerState, ConnError> {
        self.request(Command::State).await
    }

    /// Stop the event loop and release the port.
    pub async fn close(mut self) -> Result<(), ConnError> {
        let result = self.request(Command::Close).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ConnError::Closed)?;
        rx.await.map_err(|_| ConnError::Closed)?
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConnection
// ---------------------------------------------------------------------------

enum Pending {
    Accept(Reply<()>),
    Recv(Reply<Vec<u8>>),
}

impl Pending {
    fn fail(self, err: ConnError) {
        match self {
            Pending::Accept(reply) => complete(reply, Err(err)),
            Pending::Recv(reply) => complete(reply, Err(err)),
        }
    }
}

struct ServerConnection {
    config: Config,
    port: Port,
    port_open: bool,
    state: ServerState,
    /// Client's ISN from its SYN.
    x_value: u16,
    /// Our ISN, sent in the SYN|ACK.
    y_value: u16,
    receiver: SrReceiver,
    /// The client sent FIN; no more data will arrive.
    peer_closed: bool,
    pending: Option<Pending>,
}

impl ServerConnection {
    fn new(port: Port, config: Config) -> Self {
        let receiver = SrReceiver::new(config.window as usize);
        Self {
            config,
            port,
            port_open: true,
            state: ServerState::Closed,
            x_value: 0,
            y_value: 0,
            receiver,
            peer_closed: false,
            pending: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.on_command(cmd) {
                        break;
                    }
                }
                bytes = self.port.recv_segment(), if self.port_open => {
                    match bytes {
                        Some(bytes) => self.on_datagram(&bytes),
                        None => self.on_port_closed(),
                    }
                }
            }
        }
        if let Some(pending) = self.pending.take() {
            pending.fail(ConnError::Closed);
        }
        log::debug!("[server] event loop stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Accept(reply) => self.start_accept(reply),
            Command::Recv(reply) => self.start_recv(reply),
            Command::Clean(reply) => {
                self.clean();
                complete(reply, Ok(()));
            }
            Command::State(reply) => complete(reply, Ok(self.state)),
            Command::Close(reply) => {
                self.clean();
                complete(reply, Ok(()));
                return false;
            }
        }
        true
    }

    fn start_accept(&mut self, reply: Reply<()>) {
        if !self.port_open {
            return complete(reply, Err(PortError::Closed.into()));
        }
        match self.state {
            ServerState::Closed => {
                self.state = ServerState::Listen;
                self.peer_closed = false;
                log::info!("[server] listening");
            }
            ServerState::Listen | ServerState::SynReceived => {}
            ServerState::Established => {
                return complete(reply, Err(ConnError::BadState(self.state.to_string())));
            }
        }
        self.supersede();
        self.pending = Some(Pending::Accept(reply));
    }

    fn start_recv(&mut self, reply: Reply<Vec<u8>>) {
        if self.receiver.pending() > 0 {
            return complete(reply, Ok(self.receiver.deliver()));
        }
        if self.peer_closed {
            return complete(reply, Err(ConnError::Eof));
        }
        if self.state == ServerState::Closed {
            return complete(reply, Err(ConnError::NotConnected));
        }
        self.supersede();
        self.pending = Some(Pending::Recv(reply));
    }

    fn clean(&mut self) {
        self.supersede();
        self.state = ServerState::Closed;
        self.x_value = 0;
        self.y_value = 0;
        self.peer_closed = false;
        self.receiver = SrReceiver::new(self.config.window as usize);
    }

    fn supersede(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.fail(ConnError::Superseded);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound segments
    // -----------------------------------------------------------------------

    fn on_datagram(&mut self, bytes: &[u8]) {
        let Some(seg) = decode_inbound("server", bytes) else {
            return;
        };
        match Inbound::classify(seg.header.flags) {
            Inbound::Syn => self.on_syn(&seg),
            Inbound::Ack => self.on_ack(&seg),
            Inbound::Data => self.on_data(&seg),
            Inbound::Fin => self.on_fin(),
            _ => log::debug!(
                "[server] ignoring {} segment in state {}",
                seg.header.flags,
                self.state
            ),
        }
    }

    fn on_syn(&mut self, seg: &Segment) {
        let x = seg.header.seq;
        match self.state {
            ServerState::Listen => {}
            ServerState::SynReceived | ServerState::Established if x == self.x_value => {
                // Our SYN|ACK was lost or the SYN duplicated.
                log::debug!("[server] repeated SYN x={x}");
                self.send_syn_ack();
                return;
            }
            ServerState::SynReceived => {
                log::debug!("[server] SYN with new x={x}; restarting handshake");
            }
            other => {
                log::debug!("[server] ignoring SYN in state {other}");
                return;
            }
        }

        self.x_value = x;
        self.y_value = rand::random::<u16>();
        self.receiver = SrReceiver::new(self.config.window as usize);
        self.peer_closed = false;
        self.state = ServerState::SynReceived;
        self.send_syn_ack();
    }

    fn on_ack(&mut self, seg: &Segment) {
        if self.state != ServerState::SynReceived {
            log::debug!("[server] ignoring ACK in state {}", self.state);
            return;
        }
        let expected = self.y_value.wrapping_add(1);
        if seg.header.ack != expected {
            log::warn!(
                "[server] handshake ACK acknowledges {} but expected {}; ignoring",
                seg.header.ack,
                expected
            );
            return;
        }
        self.establish();
    }

    fn on_data(&mut self, seg: &Segment) {
        match self.state {
            ServerState::Established => {}
            ServerState::SynReceived => {
                log::debug!("[server] data before handshake ACK; assuming it was lost");
                self.establish();
            }
            other => {
                log::debug!("[server] ignoring data in state {other}");
                return;
            }
        }

        let receipt = self.receiver.on_data_segment(seg);
        match receipt {
            Receipt::Accepted { ack, delivered } => log::debug!(
                "[server] ← DATA seq={ack} len={} (delivered {delivered}, base {})",
                seg.header.data_length,
                self.receiver.rec_base()
            ),
            Receipt::Duplicate { ack } => log::debug!("[server] ← duplicate seq={ack}"),
            Receipt::Corrupt => log::warn!(
                "[server] dropping corrupt segment seq={}",
                seg.header.seq
            ),
            Receipt::OutOfWindow => log::debug!(
                "[server] dropping seq={} outside window [{}, +{})",
                seg.header.seq,
                self.receiver.rec_base(),
                self.receiver.window_size()
            ),
        }
        if let Some(ack) = receipt.ack() {
            self.send_control(0, ack, Flags::ACK);
        }

        if self.receiver.pending() > 0 {
            match self.pending.take() {
                Some(Pending::Recv(reply)) => complete(reply, Ok(self.receiver.deliver())),
                other => self.pending = other,
            }
        }
    }

    fn on_fin(&mut self) {
        self.send_control(0, 0, Flags::FIN_ACK);
        match self.state {
            ServerState::Established | ServerState::SynReceived => {}
            other => {
                log::debug!("[server] answered stray FIN in state {other}");
                return;
            }
        }
        self.state = ServerState::Closed;
        self.peer_closed = true;
        log::info!("[server] client disconnected");

        match self.pending.take() {
            Some(Pending::Recv(reply)) => {
                if self.receiver.pending() > 0 {
                    complete(reply, Ok(self.receiver.deliver()));
                } else {
                    complete(reply, Err(ConnError::Eof));
                }
            }
            Some(Pending::Accept(reply)) => complete(reply, Err(ConnError::Eof)),
            None => {}
        }
    }

    fn establish(&mut self) {
        self.state = ServerState::Established;
        log::info!(
            "[server] connected (x={}, y={})",
            self.x_value,
            self.y_value
        );
        match self.pending.take() {
            Some(Pending::Accept(reply)) => complete(reply, Ok(())),
            other => self.pending = other,
        }
    }

    fn on_port_closed(&mut self) {
        log::warn!("[server] port closed");
        self.port_open = false;
        if let Some(pending) = self.pending.take() {
            pending.fail(PortError::Closed.into());
        }
    }

    // -----------------------------------------------------------------------
    // Outbound segments
    // -----------------------------------------------------------------------

    fn send_syn_ack(&mut self) {
        let ack = self.x_value.wrapping_add(1);
        log::debug!("[server] → SYN|ACK seq={} ack={ack}", self.y_value);
        let seg = Segment::control(self.y_value, ack, Flags::SYN_ACK, self.config.window);
        self.send_segment(&seg);
    }

    fn send_control(&mut self, seq: u16, ack: u16, flags: Flags) {
        log::debug!("[server] → {flags} seq={seq} ack={ack}");
        self.send_segment(&Segment::control(seq, ack, flags, 0));
    }

    fn send_segment(&mut self, seg: &Segment) {
        if let Err(e) = transmit(&self.port, seg) {
            log::warn!("[server] transmit failed: {e}");
            if matches!(e, ConnError::Port(PortError::Closed)) {
                self.on_port_closed();
            }
        }
    }
}
