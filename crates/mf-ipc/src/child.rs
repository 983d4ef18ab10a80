//! The child side of a channel: the command loop and its link back to the
//! parent.

use nix::unistd::{getppid, Pid};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::channel::ProcessChannel;
use crate::error::{Error, Result};
use crate::wire::{
    self, Command, Reply, CONTINUATION, EXIT_CODE, FORWARD_COMMAND, READ_RESULT,
};

/// How long a child waits for the answer to one of its callbacks.
pub const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether the command loop keeps running after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Behavior of a forked child.
///
/// The handler is moved into the child at fork time and dropped there once
/// the command loop ends.
pub trait ChildHandler {
    /// Runs once in the child before the first command.
    fn init_child(&mut self) {}

    /// Handle one command. Every command must be answered with exactly one
    /// terminal [`ChildLink::send_result`] (or `send_failure`), optionally
    /// preceded by callbacks. Returning `Err` ends the child.
    fn handle_command(&mut self, link: &mut ChildLink, command: Command) -> Result<Flow>;

    /// The channel a [`FORWARD_COMMAND`] for `peer` should be relayed to.
    fn forward_target(&mut self, _peer: u64) -> Option<&ProcessChannel> {
        None
    }
}

/// The child's end of the socket.
pub struct ChildLink {
    stream: UnixStream,
    parent: Pid,
}

impl ChildLink {
    pub(crate) fn new(stream: UnixStream, parent: Pid, poll: Duration) -> Result<Self> {
        stream.set_read_timeout(Some(poll))?;
        Ok(Self { stream, parent })
    }

    /// Read the next command. Without `use_timeout` the read only gives up
    /// once the parent has died; with it, after [`CONTINUATION_TIMEOUT`].
    pub fn read_command(&mut self, use_timeout: bool) -> Result<Command> {
        let parent = self.parent;
        let deadline = use_timeout.then(|| Instant::now() + CONTINUATION_TIMEOUT);
        let mut keep_waiting =
            || getppid() == parent && deadline.map_or(true, |d| Instant::now() < d);
        match wire::read_command(&mut self.stream, &mut keep_waiting) {
            Ok(command) => Ok(command),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Closed),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if getppid() != parent {
                    Err(Error::PeerGone {
                        pid: parent.as_raw(),
                    })
                } else {
                    Err(Error::Protocol("timed out waiting for a continuation".into()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send the terminal result of the current command.
    pub fn send_result(&mut self, value: i64, payload: &[u8]) -> Result<()> {
        wire::write_reply(&mut self.stream, value, payload)?;
        Ok(())
    }

    /// Send a terminal failure carrying a status code and message.
    pub fn send_failure(&mut self, code: i64, message: &str) -> Result<()> {
        self.send_reply(Reply::failure(code, message))
    }

    pub(crate) fn send_reply(&mut self, reply: Reply) -> Result<()> {
        self.send_result(reply.value, &reply.payload)
    }

    /// Fire-and-forget callback; the parent handles it and keeps reading.
    pub fn callback(&mut self, tag: u32, payload: &[u8]) -> Result<()> {
        self.send_reply(Reply::callback(tag, false, payload.to_vec()))
    }

    /// Callback that blocks until the parent answers with a continuation.
    pub fn request(&mut self, tag: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_reply(Reply::callback(tag, true, payload.to_vec()))?;
        let command = self.read_command(true)?;
        match command.token {
            CONTINUATION => Ok(command.payload),
            EXIT_CODE => Err(Error::Closed),
            other => Err(Error::Protocol(format!(
                "expected continuation for callback {tag}, got command {other}"
            ))),
        }
    }
}

/// Entry point of a freshly forked child. Returns the exit status.
pub(crate) fn run_child<H: ChildHandler>(
    stream: UnixStream,
    parent: Pid,
    poll: Duration,
    mut handler: H,
) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || -> Result<()> {
        let mut link = ChildLink::new(stream, parent, poll)?;
        handler.init_child();
        let result = child_loop(&mut link, &mut handler);
        // Peers the handler owns are told to exit and reaped here.
        drop(handler);
        result
    }));
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            debug!(pid = std::process::id(), "child loop ended: {e}");
            1
        }
        Err(_) => {
            warn!(pid = std::process::id(), "child handler panicked");
            101
        }
    }
}

/// Serve commands until told to exit or the parent disappears.
pub fn child_loop<H: ChildHandler + ?Sized>(link: &mut ChildLink, handler: &mut H) -> Result<()> {
    loop {
        let command = match link.read_command(false) {
            Ok(command) => command,
            Err(Error::Closed | Error::PeerGone { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        match command.token {
            EXIT_CODE => return Ok(()),
            // Nothing is pending on a direct link; answer nothing.
            READ_RESULT => continue,
            FORWARD_COMMAND => relay(link, handler, &command.payload)?,
            _ => {
                if handler.handle_command(link, command)? == Flow::Exit {
                    return Ok(());
                }
            }
        }
    }
}

/// Pass a forwarded command to the named peer and send back one reply.
fn relay<H: ChildHandler + ?Sized>(
    link: &mut ChildLink,
    handler: &mut H,
    envelope: &[u8],
) -> Result<()> {
    let (peer, inner) = wire::decode_forward(envelope)
        .map_err(|e| Error::Protocol(format!("bad forward envelope: {e}")))?;
    let reply = match handler.forward_target(peer) {
        Some(channel) => {
            let mut session = channel.lock();
            if inner.token == READ_RESULT {
                session.read_result()
            } else {
                match session.send_command(inner.token, &inner.payload) {
                    Ok(()) => session.read_result(),
                    Err(e) => {
                        warn!(peer, "relay to peer failed: {e}");
                        Reply::lost()
                    }
                }
            }
        }
        None => {
            warn!("{}", Error::UnknownPeer(peer));
            Reply::lost()
        }
    };
    link.send_reply(reply)
}
