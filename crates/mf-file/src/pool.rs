//! A spawner process for file workers.
//!
//! Forking from a small dedicated process keeps workers from inheriting
//! the editor's address space. Workers forked by the pool are its
//! children; the editor reaches them through tunneled channels and the
//! pool relays every command.

use mf_core::{ByteReader, ByteWriter, Error, Result};
use mf_decode::DecoderRegistry;
use mf_ipc::{ChildHandler, ChildLink, Command, Flow, Pid, ProcessChannel, DEFAULT_POLL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::handle::{settle, FileWorkerHandle};
use crate::opcode::{DELETE_FILEFORK, NEW_FILEFORK};
use crate::worker::FileWorker;

#[derive(Debug)]
pub struct WorkerPool {
    channel: Arc<ProcessChannel>,
}

impl WorkerPool {
    pub fn start(registry: DecoderRegistry) -> Result<Self> {
        Self::start_with(registry, DEFAULT_POLL)
    }

    /// Start the pool. `poll` is also the liveness interval of every
    /// worker it forks.
    pub fn start_with(registry: DecoderRegistry, poll: Duration) -> Result<Self> {
        let server = PoolServer {
            registry,
            poll,
            workers: HashMap::new(),
            next_id: 1,
        };
        let channel = ProcessChannel::spawn_with(server, poll)
            .map_err(|e| Error::WorkerFailed(format!("cannot start worker pool: {e}")))?;
        info!(pid = channel.pid().as_raw(), "worker pool started");
        Ok(Self {
            channel: Arc::new(channel),
        })
    }

    pub fn pid(&self) -> i32 {
        self.channel.pid().as_raw()
    }

    pub fn is_running(&self) -> bool {
        self.channel.child_running()
    }

    /// Have the pool fork a worker and return a handle routed through it.
    pub fn new_filefork(&self) -> Result<FileWorkerHandle> {
        let reply = self.channel.call(NEW_FILEFORK, &[]);
        let (_, payload) = settle(self.pid(), NEW_FILEFORK, reply)?;
        let mut input = ByteReader::new(&payload);
        let id = input.u64()?;
        let pid = input.i32()?;
        debug!(id, pid, "pool forked worker");
        Ok(FileWorkerHandle::leased(
            Arc::clone(&self.channel),
            id,
            Pid::from_raw(pid),
        ))
    }

    /// Stop and reap a worker this pool forked.
    pub fn delete_filefork(&self, mut handle: FileWorkerHandle) -> Result<()> {
        if !handle.belongs_to(&self.channel) {
            return Err(Error::state(format!(
                "worker {} was not forked by pool {}",
                handle.pid(),
                self.pid()
            )));
        }
        handle.release()
    }
}

struct PoolServer {
    registry: DecoderRegistry,
    poll: Duration,
    workers: HashMap<u64, ProcessChannel>,
    next_id: u64,
}

impl PoolServer {
    fn fork_worker(&mut self) -> Result<Vec<u8>> {
        let channel = ProcessChannel::spawn_with(FileWorker::new(self.registry.clone()), self.poll)
            .map_err(|e| Error::WorkerFailed(format!("cannot fork file worker: {e}")))?;
        let id = self.next_id;
        self.next_id += 1;
        let mut out = ByteWriter::new();
        out.put_u64(id).put_i32(channel.pid().as_raw());
        self.workers.insert(id, channel);
        Ok(out.into_inner())
    }

    fn delete_worker(&mut self, payload: &[u8]) -> Result<()> {
        let id = ByteReader::new(payload).u64()?;
        match self.workers.remove(&id) {
            // Dropping the channel tells the worker to exit and reaps it.
            Some(channel) => {
                debug!(id, pid = channel.pid().as_raw(), "reaping worker");
                Ok(())
            }
            None => Err(Error::NotFound(format!("no worker with id {id}"))),
        }
    }
}

impl ChildHandler for PoolServer {
    fn init_child(&mut self) {
        debug!(pid = std::process::id(), "worker pool ready");
    }

    fn handle_command(&mut self, link: &mut ChildLink, command: Command) -> mf_ipc::Result<Flow> {
        let outcome = match command.token {
            NEW_FILEFORK => self.fork_worker(),
            DELETE_FILEFORK => self.delete_worker(&command.payload).map(|()| Vec::new()),
            other => Err(Error::Protocol(format!("pool does not understand command {other}"))),
        };
        match outcome {
            Ok(payload) => link.send_result(0, &payload)?,
            Err(e) => {
                warn!("pool command {} failed: {e}", command.token);
                link.send_failure(e.status().code(), &e.to_string())?;
            }
        }
        Ok(Flow::Continue)
    }

    fn forward_target(&mut self, peer: u64) -> Option<&ProcessChannel> {
        self.workers.get(&peer)
    }
}
