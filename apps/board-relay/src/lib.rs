//! Relays board activity into chat.
//!
//! Board events arrive over [`board_stream`] clients, are translated into
//! per-card [`delta::Delta`]s by the [`relay`] router, coalesced by the
//! [`dispatch`] queue and finally sent through a [`chat`] transport.

pub mod api;
pub mod charset;
pub mod chat;
pub mod config;
pub mod delta;
pub mod dispatch;
pub mod relay;
pub mod telemetry;
