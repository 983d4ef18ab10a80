//! The parent side of a channel.
//!
//! A [`ProcessChannel`] either owns a socket to a child it forked
//! ([`ProcessChannel::spawn`]) or reaches a grandchild through another
//! channel whose child relays for it ([`ProcessChannel::tunneled`]).
//! Callers lock the channel for a whole command/result exchange.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use parking_lot::{Mutex, MutexGuard};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::child::{run_child, ChildHandler};
use crate::error::{Error, Result};
use crate::liveness;
use crate::wire::{self, Reply, EXIT_CODE, FORWARD_COMMAND, READ_RESULT};

/// Default interval between liveness checks while a read is blocked.
pub const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Time a child gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

enum Link {
    Direct {
        stream: UnixStream,
        broken: bool,
    },
    Tunnel {
        tunnel: Arc<ProcessChannel>,
        peer: u64,
        stash: Option<Reply>,
    },
}

/// A bidirectional command channel to a child process.
pub struct ProcessChannel {
    pid: Pid,
    tunneled: bool,
    link: Mutex<Link>,
}

impl std::fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessChannel")
            .field("pid", &self.pid.as_raw())
            .field("tunneled", &self.tunneled)
            .finish()
    }
}

impl ProcessChannel {
    /// Fork a child that runs `handler` until told to exit.
    pub fn spawn<H: ChildHandler>(handler: H) -> Result<Self> {
        Self::spawn_with(handler, DEFAULT_POLL)
    }

    /// Like [`ProcessChannel::spawn`] with an explicit liveness poll interval.
    pub fn spawn_with<H: ChildHandler>(handler: H, poll: Duration) -> Result<Self> {
        let (parent_end, child_end) = UnixStream::pair()?;
        let parent = getpid();

        // SAFETY: the child only runs the handler's command loop and then
        // leaves through `_exit`, so destructors of objects inherited from
        // the parent never run twice.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Child => {
                drop(parent_end);
                let status = run_child(child_end, parent, poll, handler);
                // SAFETY: terminates the child without unwinding into the
                // parent's copy of the stack.
                unsafe { libc::_exit(status) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                let channel = Self {
                    pid: child,
                    tunneled: false,
                    link: Mutex::new(Link::Direct {
                        stream: parent_end,
                        broken: false,
                    }),
                };
                if let Link::Direct { stream, .. } = &*channel.link.lock() {
                    stream.set_read_timeout(Some(poll))?;
                }
                debug!(pid = child.as_raw(), "spawned child process");
                Ok(channel)
            }
        }
    }

    /// A channel to `pid`, which is reached by relaying through `tunnel`
    /// under the relay's id `peer`.
    pub fn tunneled(tunnel: Arc<ProcessChannel>, peer: u64, pid: Pid) -> Self {
        Self {
            pid,
            tunneled: true,
            link: Mutex::new(Link::Tunnel {
                tunnel,
                peer,
                stash: None,
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    /// Whether the child is alive and not a zombie.
    pub fn child_running(&self) -> bool {
        liveness::child_running(self.pid)
    }

    /// Take exclusive use of the channel for one exchange.
    pub fn lock(&self) -> Session<'_> {
        Session {
            pid: self.pid,
            link: self.link.lock(),
        }
    }

    /// Send a command and wait for its result. A send failure reads as a
    /// lost peer.
    pub fn call(&self, token: i32, payload: &[u8]) -> Reply {
        let mut session = self.lock();
        match session.send_command(token, payload) {
            Ok(()) => session.read_result(),
            Err(e) => {
                debug!(pid = self.pid.as_raw(), token, "send failed: {e}");
                Reply::lost()
            }
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        let Link::Direct { stream, .. } = self.link.get_mut() else {
            return;
        };
        if let Err(e) = wire::write_command(stream, EXIT_CODE, &[]) {
            debug!(pid = self.pid.as_raw(), "exit request not delivered: {e}");
        }
        reap(self.pid);
    }
}

/// Wait for `pid` to exit, killing it after a grace period.
fn reap(pid: Pid) {
    let deadline = Instant::now() + EXIT_GRACE;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(WaitStatus::StillAlive) => {
                warn!(pid = pid.as_raw(), "child ignored exit request; killing");
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return;
            }
            Ok(status) => {
                debug!(pid = pid.as_raw(), ?status, "child reaped");
                return;
            }
            // Already reaped, or not our child.
            Err(_) => return,
        }
    }
}

/// Exclusive access to a channel for one command/result exchange.
pub struct Session<'a> {
    pid: Pid,
    link: MutexGuard<'a, Link>,
}

impl Session<'_> {
    /// Send a command. On a tunnel the relay's reply is stashed for the
    /// next [`Session::read_result`].
    pub fn send_command(&mut self, token: i32, payload: &[u8]) -> Result<()> {
        let pid = self.pid.as_raw();
        match &mut *self.link {
            Link::Direct { stream, broken } => {
                if *broken {
                    return Err(Error::PeerGone { pid });
                }
                wire::write_command(stream, token, payload).map_err(|e| {
                    *broken = true;
                    debug!(pid, "write to child failed: {e}");
                    Error::PeerGone { pid }
                })
            }
            Link::Tunnel {
                tunnel,
                peer,
                stash,
            } => {
                let envelope = wire::encode_forward(*peer, token, payload);
                *stash = Some(tunnel.call(FORWARD_COMMAND, &envelope));
                Ok(())
            }
        }
    }

    /// Read the next result, or [`Reply::lost`] once the child is gone.
    pub fn read_result(&mut self) -> Reply {
        let pid = self.pid;
        match &mut *self.link {
            Link::Direct { stream, broken } => {
                if *broken {
                    return Reply::lost();
                }
                let mut keep_waiting = || liveness::child_running(pid);
                match wire::read_reply(stream, &mut keep_waiting) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(pid = pid.as_raw(), "lost child: {e}");
                        *broken = true;
                        Reply::lost()
                    }
                }
            }
            Link::Tunnel {
                tunnel,
                peer,
                stash,
            } => stash.take().unwrap_or_else(|| {
                tunnel.call(FORWARD_COMMAND, &wire::encode_forward(*peer, READ_RESULT, &[]))
            }),
        }
    }
}
