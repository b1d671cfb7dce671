//! Client side of a bTCP connection.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  connect / send / disconnect / clean / close
//!      ▼
//!  ClientSocket ── Command + oneshot reply ──▶ event loop task
//!                                                ├── ClientConnection
//!                                                │     ├── ClientState, x/y values
//!                                                │     └── SrSender
//!                                                └── Port (datagrams in/out)
//! ```
//!
//! The event loop exclusively owns the connection state, so inbound segments,
//! timer ticks and application commands are serialised without locks.  A
//! blocking operation parks its reply as the single [`Pending`] operation and
//! the loop completes it when the peer answers or the retry budget runs out.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, MAX_CONNECT_ATTEMPTS, MAX_DISCONNECT_ATTEMPTS};
use crate::connection::{complete, decode_inbound, transmit, ConnError, Inbound, Reply};
use crate::port::{Port, PortError};
use crate::segment::{Flags, Segment};
use crate::sr_sender::{wire_seq, AckOutcome, SrSender};
use crate::state::ClientState;
use crate::timer::{Retry, RetryTimer};

// ---------------------------------------------------------------------------
// ClientSocket: application handle
// ---------------------------------------------------------------------------

enum Command {
    Connect(Reply<()>),
    Send(Vec<u8>, Reply<()>),
    Disconnect(Reply<()>),
    Clean(Reply<()>),
    State(Reply<ClientState>),
    Close(Reply<()>),
}

/// A bTCP client socket.
///
/// Every method is blocking from the caller's point of view: it returns once
/// the protocol step it started has completed or failed.
pub struct ClientSocket {
    commands: mpsc::Sender<Command>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ClientSocket {
    /// Wrap an existing port.  Spawns the event loop on the current runtime.
    pub fn new(port: Port, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let local_addr = port.local_addr();
        let (commands, rx) = mpsc::channel(16);
        let conn = ClientConnection::new(port, config);
        let task = tokio::spawn(conn.run(rx));
        Ok(Self {
            commands,
            task: Some(task),
            local_addr,
        })
    }

    /// Bind a UDP port at `local` talking to the server at `remote`.
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

    /// Perform the three-way handshake.
    ///
    /// Fails with [`ConnError::HandshakeTimedOut`] once
    /// [`MAX_CONNECT_ATTEMPTS`] SYNs went unanswered; the socket then stays
    /// unconnected.
    pub async fn connect(&mut self) -> Result<(), ConnError> {
        self.request(Command::Connect).await
    }

    /// Reliably deliver `data`; returns once every segment is acknowledged.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnError> {
        let data = data.to_vec();
        self.request(|reply| Command::Send(data, reply)).await
    }

    /// Tear the connection down.
    ///
    /// If the server never confirms, the socket is closed locally anyway and
    /// [`ConnError::TeardownTimedOut`] is returned.
    pub async fn disconnect(&mut self) -> Result<(), ConnError> {
        self.request(Command::Disconnect).await
    }

    /// Reset the connection to its initial values; the port stays bound.
    pub async fn clean(&mut self) -> Result<(), ConnError> {
        self.request(Command::Clean).await
    }

    pub async fn state(&self) -> Result<ClientState, ConnError> {
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

impl Drop for ClientSocket {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConnection: state owned by the event loop
// ---------------------------------------------------------------------------

/// The blocking operation currently in progress.
enum Pending {
    Connect { reply: Reply<()>, retry: RetryTimer },
    Send { reply: Reply<()> },
    Disconnect { reply: Reply<()>, retry: RetryTimer },
}

impl Pending {
    fn fail(self, err: ConnError) {
        match self {
            Pending::Connect { reply, .. }
            | Pending::Send { reply }
            | Pending::Disconnect { reply, .. } => complete(reply, Err(err)),
        }
    }
}

struct ClientConnection {
    config: Config,
    port: Port,
    port_open: bool,
    state: ClientState,
    /// Our ISN, proposed in the SYN.
    x_value: u16,
    /// Server's ISN, learned from the SYN|ACK.
    y_value: u16,
    /// Receive window the server advertised in its SYN|ACK.
    peer_window: u16,
    sender: SrSender,
    pending: Option<Pending>,
}

impl ClientConnection {
    fn new(port: Port, config: Config) -> Self {
        let sender = SrSender::new(config.window as usize, config.timeout);
        Self {
            config,
            port,
            port_open: true,
            state: ClientState::Idle,
            x_value: 0,
            y_value: 0,
            peer_window: 0,
            sender,
            pending: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

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
                _ = tick.tick() => self.on_tick(Instant::now()),
            }
        }
        if let Some(pending) = self.pending.take() {
            pending.fail(ConnError::Closed);
        }
        log::debug!("[client] event loop stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Returns `false` when the loop should stop.
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect(reply) => self.start_connect(reply),
            Command::Send(data, reply) => self.start_send(data, reply),
            Command::Disconnect(reply) => self.start_disconnect(reply),
            Command::Clean(reply) => {
                self.clean();
                complete(reply, Ok(()));
            }
            Command::State(reply) => complete(reply, Ok(self.state)),
            Command::Close(reply) => {
                self.clean();
                self.state = ClientState::Closed;
                complete(reply, Ok(()));
                return false;
            }
        }
        true
    }

    fn start_connect(&mut self, reply: Reply<()>) {
        if !self.port_open {
            return complete(reply, Err(PortError::Closed.into()));
        }
        match self.state {
            ClientState::Idle | ClientState::Closed | ClientState::SynSent => {}
            other => return complete(reply, Err(ConnError::BadState(other.to_string()))),
        }
        self.supersede();
        self.sender = SrSender::new(self.config.window as usize, self.config.timeout);
        self.state = ClientState::SynSent;
        self.send_syn();
        log::info!("[client] connecting (x={})", self.x_value);
        self.pending = Some(Pending::Connect {
            reply,
            retry: RetryTimer::start(self.config.timeout, MAX_CONNECT_ATTEMPTS, Instant::now()),
        });
    }

    fn start_send(&mut self, data: Vec<u8>, reply: Reply<()>) {
        if self.state != ClientState::Established {
            return complete(reply, Err(ConnError::NotConnected));
        }
        self.supersede();
        let chunks = self.sender.start_sending(&data);
        log::debug!("[client] sending {} bytes in {} segment(s)", data.len(), chunks);
        self.pending = Some(Pending::Send { reply });
        self.progress_send(Instant::now());
    }

    fn start_disconnect(&mut self, reply: Reply<()>) {
        match self.state {
            ClientState::Idle | ClientState::Closed => return complete(reply, Ok(())),
            ClientState::SynSent | ClientState::Established | ClientState::FinSent => {}
        }
        if !self.port_open {
            self.state = ClientState::Closed;
            return complete(reply, Err(PortError::Closed.into()));
        }
        self.supersede();
        self.state = ClientState::FinSent;
        self.send_control(0, 0, Flags::FIN);
        log::info!("[client] disconnecting");
        self.pending = Some(Pending::Disconnect {
            reply,
            retry: RetryTimer::start(
                self.config.timeout,
                MAX_DISCONNECT_ATTEMPTS,
                Instant::now(),
            ),
        });
    }

    /// Reset every per-connection value; the port is kept.
    fn clean(&mut self) {
        self.supersede();
        self.state = ClientState::Idle;
        self.x_value = 0;
        self.y_value = 0;
        self.peer_window = 0;
        self.sender = SrSender::new(self.config.window as usize, self.config.timeout);
    }

    fn supersede(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.fail(ConnError::Superseded);
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn on_tick(&mut self, now: Instant) {
        match self.pending.take() {
            Some(Pending::Connect { reply, mut retry }) => match retry.poll(now) {
                Retry::Wait => self.pending = Some(Pending::Connect { reply, retry }),
                Retry::Resend(attempt) => {
                    log::debug!("[client] connect timeout, SYN attempt {attempt}");
                    self.send_syn();
                    self.pending = Some(Pending::Connect { reply, retry });
                }
                Retry::Exhausted => {
                    log::warn!(
                        "[client] connect failed: {} SYN attempts unanswered",
                        retry.attempts()
                    );
                    self.state = ClientState::Idle;
                    complete(
                        reply,
                        Err(ConnError::HandshakeTimedOut {
                            attempts: retry.attempts(),
                        }),
                    );
                }
            },
            Some(Pending::Disconnect { reply, mut retry }) => match retry.poll(now) {
                Retry::Wait => self.pending = Some(Pending::Disconnect { reply, retry }),
                Retry::Resend(attempt) => {
                    log::debug!("[client] disconnect timeout, FIN attempt {attempt}");
                    self.send_control(0, 0, Flags::FIN);
                    self.pending = Some(Pending::Disconnect { reply, retry });
                }
                Retry::Exhausted => {
                    log::warn!(
                        "[client] teardown not confirmed after {} FINs; closing locally",
                        retry.attempts()
                    );
                    self.state = ClientState::Closed;
                    complete(
                        reply,
                        Err(ConnError::TeardownTimedOut {
                            attempts: retry.attempts(),
                        }),
                    );
                }
            },
            Some(send @ Pending::Send { .. }) => {
                self.pending = Some(send);
                self.progress_send(now);
            }
            None => {}
        }
    }

    /// Push every due segment out and finish a pending `send` once the
    /// whole payload is acknowledged.
    fn progress_send(&mut self, now: Instant) {
        for seg in self.sender.poll(now) {
            let kind = if self.is_retransmit(&seg) { "retransmit" } else { "DATA" };
            log::debug!(
                "[client] → {} seq={} len={} window=[{}, {})",
                kind,
                seg.header.seq,
                seg.header.data_length,
                self.sender.send_base(),
                self.sender.send_next()
            );
            self.send_segment(&seg);
        }

        if self.sender.is_done() {
            if let Some(Pending::Send { reply }) = self.pending.take() {
                log::debug!("[client] all {} segment(s) acknowledged", self.sender.total());
                complete(reply, Ok(()));
            }
        }
    }

    fn is_retransmit(&self, seg: &Segment) -> bool {
        let base = wire_seq(self.sender.send_base());
        let offset = seg.header.seq.wrapping_sub(base) as usize;
        self.sender
            .entry(self.sender.send_base() + offset)
            .is_some_and(|e| e.tx_count > 1)
    }

    // -----------------------------------------------------------------------
    // Inbound segments
    // -----------------------------------------------------------------------

    fn on_datagram(&mut self, bytes: &[u8]) {
        let Some(seg) = decode_inbound("client", bytes) else {
            return;
        };
        match Inbound::classify(seg.header.flags) {
            Inbound::SynAck => self.on_syn_ack(&seg),
            Inbound::FinAck => self.on_fin_ack(),
            Inbound::Ack => self.on_ack(&seg),
            _ => log::debug!(
                "[client] ignoring {} segment in state {}",
                seg.header.flags,
                self.state
            ),
        }
    }

    fn on_syn_ack(&mut self, seg: &Segment) {
        let h = &seg.header;
        let expected = self.x_value.wrapping_add(1);
        match self.state {
            ClientState::SynSent | ClientState::Established => {}
            other => {
                log::debug!("[client] ignoring SYN|ACK in state {other}");
                return;
            }
        }
        if h.ack != expected {
            log::warn!(
                "[client] SYN|ACK acknowledges {} but expected {}; ignoring",
                h.ack,
                expected
            );
            return;
        }

        if self.state == ClientState::Established {
            // Our final ACK was lost or the SYN|ACK duplicated: repeat it.
            self.send_control(expected, h.seq.wrapping_add(1), Flags::ACK);
            return;
        }

        self.y_value = h.seq;
        self.peer_window = h.window;
        self.sender = SrSender::new(self.send_window(), self.config.timeout);
        self.send_control(expected, self.y_value.wrapping_add(1), Flags::ACK);
        self.state = ClientState::Established;
        log::info!(
            "[client] connected (x={}, y={}, server window={}, send window={})",
            self.x_value,
            self.y_value,
            self.peer_window,
            self.sender.window_size()
        );

        match self.pending.take() {
            Some(Pending::Connect { reply, .. }) => complete(reply, Ok(())),
            other => self.pending = other,
        }
    }

    /// Never keep more in flight than the server can buffer.  A zero
    /// advertisement carries no information and leaves our own window.
    fn send_window(&self) -> usize {
        match self.peer_window {
            0 => self.config.window as usize,
            peer => self.config.window.min(peer) as usize,
        }
    }

    fn on_fin_ack(&mut self) {
        if !self.state.is_connected() {
            log::debug!("[client] ignoring ACK|FIN in state {}", self.state);
            return;
        }
        self.state = ClientState::Closed;
        log::info!("[client] disconnected");
        match self.pending.take() {
            Some(Pending::Disconnect { reply, .. }) => complete(reply, Ok(())),
            Some(other) => other.fail(ConnError::Eof),
            None => {}
        }
    }

    fn on_ack(&mut self, seg: &Segment) {
        if !self.state.is_connected() {
            log::debug!("[client] ignoring ACK in state {}", self.state);
            return;
        }
        let ack = seg.header.ack;
        match self.sender.on_ack(ack) {
            AckOutcome::Advanced(n) => {
                log::debug!("[client] ← ACK {ack} (window slid {n})");
                if matches!(self.pending, Some(Pending::Send { .. })) {
                    self.progress_send(Instant::now());
                }
            }
            AckOutcome::Buffered => log::debug!("[client] ← ACK {ack} (beyond gap)"),
            AckOutcome::Duplicate => log::debug!("[client] ← ACK {ack} (duplicate)"),
            AckOutcome::OutOfRange => {
                log::warn!("[client] ← ACK {ack} for a segment never sent; ignoring")
            }
        }
    }

    fn on_port_closed(&mut self) {
        log::warn!("[client] port closed");
        self.port_open = false;
        if let Some(pending) = self.pending.take() {
            pending.fail(PortError::Closed.into());
        }
    }

    // -----------------------------------------------------------------------
    // Outbound segments
    // -----------------------------------------------------------------------

    fn send_syn(&mut self) {
        self.x_value = rand::random::<u16>();
        self.send_control(self.x_value, 0, Flags::SYN);
    }

    fn send_control(&mut self, seq: u16, ack: u16, flags: Flags) {
        log::debug!("[client] → {flags} seq={seq} ack={ack}");
        self.send_segment(&Segment::control(seq, ack, flags, 0));
    }

    fn send_segment(&mut self, seg: &Segment) {
        if let Err(e) = transmit(&self.port, seg) {
            log::warn!("[client] transmit failed: {e}");
            if matches!(e, ConnError::Port(PortError::Closed)) {
                self.on_port_closed();
            }
        }
    }
}
