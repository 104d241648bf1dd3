//! Broadcast chat hub with long-poll delivery.
//!
//! Clients join under a unique identity, publish text, and pick up what
//! others published by repeatedly calling Poll, which holds the call open
//! until something arrives or the timeout passes.
//!
//! - [`service`] is the operation surface (Join, Send, Poll, Leave).
//! - [`registry`] tracks joined identities and owns their delivery queues.
//! - [`broadcaster`] is the single worker that fans each event out.
//! - [`queue`] is the bounded per-client buffer with its overflow policies.
//! - [`message`] and [`error`] hold the shared data and failure types.
//! - [`config`] and [`cli`] describe the tunables and command line.
//! - [`protocol`], [`server`] and [`client`] carry the operations over JSON
//!   lines on TCP and provide a terminal front-end.

pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod service;
