//! `btcp`: a reliable, ordered byte stream over an unreliable datagram
//! channel, using selective-repeat ARQ.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA segments   ┌──────────────┐
//!  │   SrSender   │──────────────────▶│  SrReceiver  │
//!  └──────┬───────┘                   └──────┬───────┘
//!         │◀──────── selective ACKs ─────────┘
//!         │                                  │
//!  ┌──────▼───────┐                   ┌──────▼───────┐
//!  │ ClientSocket │                   │ ServerSocket │
//!  │ (event loop) │                   │ (event loop) │
//!  └──────┬───────┘                   └──────┬───────┘
//!         │          raw datagrams           │
//!  ┌──────▼──────────────────────────────────▼───────┐
//!  │  Port  (UDP, or in-memory through a Simulator)  │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! - [`segment`]: wire format and the one's-complement payload checksum
//! - [`port`]: datagram transport, UDP or in-memory
//! - [`simulator`]: lossy/duplicating/corrupting link for testing
//! - [`config`]: window, timeout and retry budgets
//! - [`state`]: client and server state machines
//! - [`timer`]: bounded retry timer for handshake and teardown
//! - [`sr_sender`]: selective-repeat send window
//! - [`sr_receiver`]: selective-repeat receive window
//! - [`connection`]: error type and segment dispatch shared by both roles
//! - [`client`] / [`server`]: the socket APIs

pub mod client;
pub mod config;
pub mod connection;
pub mod port;
pub mod segment;
pub mod server;
pub mod simulator;
pub mod sr_receiver;
pub mod sr_sender;
pub mod state;
pub mod timer;

pub use client::ClientSocket;
pub use config::Config;
pub use connection::ConnError;
pub use port::Port;
pub use server::ServerSocket;
