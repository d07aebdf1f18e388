//! Client for the board service's push-notification socket.
//!
//! The service speaks a socket.io 0.9 style line protocol: an HTTP
//! handshake hands out a session id, then a WebSocket carries
//! colon-delimited frames. On top of that sits a small RPC layer
//! (`reqid`-correlated calls) and fire-and-forget `notify` events.
//!
//! - [`frame`] encodes and decodes single frames
//! - [`client`] owns one connection: handshake, heartbeat, RPC, reconnects
//! - [`connector`] abstracts the HTTP + socket transport
//! - [`backoff`] paces reconnection attempts

pub mod backoff;
pub mod client;
pub mod connector;
pub mod frame;

pub use backoff::Backoff;
pub use client::{
    ConnectionState, StreamClient, StreamConfig, StreamError, StreamEvent, StreamEvents,
};
pub use connector::{Connector, SocketChannel, WebSocketConnector};
pub use frame::{Frame, FrameError, FrameKind};
