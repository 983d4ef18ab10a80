//! Commands that call back into the parent before they finish.
//!
//! While a command runs, the child may send callback results (progress
//! updates, requests for data). Some of them expect the parent to answer
//! with a [`CONTINUATION`] command before the child carries on. An
//! [`Exchange`] holds the channel for the whole command and enforces that
//! ordering.

use crate::channel::{ProcessChannel, Session};
use crate::error::{Error, Result};
use crate::wire::{Reply, ReplyKind, CONTINUATION};

/// Where an exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Reading results; the next one may be a callback or the terminal one.
    AwaitingTerminalResult,
    /// The child is blocked until [`Exchange::reply`] answers callback `tag`.
    AwaitingContinuation { tag: u32 },
    Finished,
}

/// One step of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Callback {
        tag: u32,
        payload: Vec<u8>,
        wants_continuation: bool,
    },
    Done(Reply),
}

/// A command in flight on a locked channel.
pub struct Exchange<'a> {
    session: Session<'a>,
    state: ExchangeState,
}

impl<'a> Exchange<'a> {
    /// Lock `channel` and send the command.
    pub fn begin(channel: &'a ProcessChannel, token: i32, payload: &[u8]) -> Result<Self> {
        let mut session = channel.lock();
        session.send_command(token, payload)?;
        Ok(Self {
            session,
            state: ExchangeState::AwaitingTerminalResult,
        })
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Read the next result. A lost peer ends the exchange with
    /// [`Reply::lost`].
    pub fn next(&mut self) -> Result<Step> {
        match self.state {
            ExchangeState::AwaitingTerminalResult => {}
            ExchangeState::AwaitingContinuation { tag } => {
                return Err(Error::Protocol(format!(
                    "callback {tag} is still waiting for its continuation"
                )))
            }
            ExchangeState::Finished => {
                return Err(Error::Protocol("exchange already finished".into()))
            }
        }

        let reply = self.session.read_result();
        match reply.kind() {
            ReplyKind::Callback {
                tag,
                wants_continuation,
            } => {
                if wants_continuation {
                    self.state = ExchangeState::AwaitingContinuation { tag };
                }
                Ok(Step::Callback {
                    tag,
                    payload: reply.payload,
                    wants_continuation,
                })
            }
            _ => {
                self.state = ExchangeState::Finished;
                Ok(Step::Done(reply))
            }
        }
    }

    /// Answer the callback the child is blocked on.
    pub fn reply(&mut self, payload: &[u8]) -> Result<()> {
        match self.state {
            ExchangeState::AwaitingContinuation { .. } => {
                self.state = ExchangeState::AwaitingTerminalResult;
                self.session.send_command(CONTINUATION, payload)
            }
            _ => Err(Error::Protocol(
                "no callback is waiting for a continuation".into(),
            )),
        }
    }

    /// Drive the exchange to its terminal result, handing every callback to
    /// `on_callback`. Its return value answers callbacks that want one.
    pub fn run(
        mut self,
        mut on_callback: impl FnMut(u32, &[u8]) -> Vec<u8>,
    ) -> Result<Reply> {
        loop {
            match self.next()? {
                Step::Callback {
                    tag,
                    payload,
                    wants_continuation,
                } => {
                    let answer = on_callback(tag, &payload);
                    if wants_continuation {
                        self.reply(&answer)?;
                    }
                }
                Step::Done(reply) => return Ok(reply),
            }
        }
    }
}
