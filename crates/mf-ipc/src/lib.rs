//! mf-ipc: forked child processes driven over a framed Unix socket.
//!
//! The parent holds a [`ProcessChannel`] per child and issues commands on
//! it; the child runs a [`ChildHandler`] in [`child_loop`]. A child may
//! itself hold channels and relay commands to them, which lets a parent
//! reach grandchildren through [`ProcessChannel::tunneled`]. A dead or
//! hung peer never blocks the parent forever: reads poll the child's
//! liveness and yield [`READ_RESULT_FAILED`].

pub mod channel;
pub mod child;
pub mod error;
pub mod exchange;
pub mod liveness;
pub mod wire;

pub use channel::{ProcessChannel, Session, DEFAULT_POLL};
pub use child::{child_loop, ChildHandler, ChildLink, Flow};
pub use error::{Error, Result};
pub use exchange::{Exchange, ExchangeState, Step};
pub use nix::unistd::Pid;
pub use wire::{Command, Reply, ReplyKind, READ_RESULT_FAILED};
