//! A routed, ordered, at-most-once message-passing core for intra- and
//! inter-process IPC, in the spirit of Chromium's Mojo EDK: user code
//! talks to [`core::Core`] through opaque [`core::Handle`]s; handles
//! resolve to [`dispatcher::Dispatcher`]s; message-pipe and data-pipe
//! dispatchers route through the [`ports`] layer's [`ports::Node`],
//! which crosses process boundaries via [`node_controller`] once a
//! real [`channel::Channel`] is wired in.
//!
//! ```text
//! Handle -> Core's handle table -> Dispatcher -> Node (ports routing) -> NodeController -> Channel
//! ```
//!
//! Waiting comes in two flavors (§4.6): [`core::waiter::Waiter`] blocks
//! the calling thread once, and [`core::watcher::Watcher`] re-arms on
//! demand and fires its callback through a thread-local
//! [`core::request_context::RequestContext`] so it never runs with a
//! dispatcher lock held.
#![allow(clippy::type_complexity)]

pub mod channel;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod names;
pub mod node_controller;
pub mod ports;

#[cfg(feature = "testing")]
pub mod testing;

pub use core::{Core, Handle};
pub use error::{MojoResult, Result};
pub use names::{NodeName, PortName};
