//! The editor's end of one file worker.

use mf_core::{Error, FileStatus, Result};
use mf_decode::DecoderRegistry;
use mf_ipc::{Exchange, Pid, ProcessChannel, Reply, ReplyKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::opcode::{self, DELETE_FILEFORK};
use crate::worker::FileWorker;

/// A worker forked by the pool rather than by us. Dropping the handle
/// asks the pool to reap it.
struct Lease {
    pool: Arc<ProcessChannel>,
    id: u64,
}

pub struct FileWorkerHandle {
    channel: ProcessChannel,
    lease: Option<Lease>,
}

impl std::fmt::Debug for FileWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWorkerHandle")
            .field("pid", &self.pid())
            .field("pooled", &self.lease.is_some())
            .finish()
    }
}

impl FileWorkerHandle {
    /// Fork a worker directly from this process.
    pub fn spawn(registry: DecoderRegistry, poll: Duration) -> Result<Self> {
        let channel = ProcessChannel::spawn_with(FileWorker::new(registry), poll)
            .map_err(|e| Error::WorkerFailed(format!("cannot start file worker: {e}")))?;
        info!(pid = channel.pid().as_raw(), "file worker started");
        Ok(Self {
            channel,
            lease: None,
        })
    }

    pub(crate) fn leased(pool: Arc<ProcessChannel>, id: u64, pid: Pid) -> Self {
        Self {
            channel: ProcessChannel::tunneled(Arc::clone(&pool), id, pid),
            lease: Some(Lease { pool, id }),
        }
    }

    pub fn pid(&self) -> i32 {
        self.channel.pid().as_raw()
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<ProcessChannel>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| Arc::ptr_eq(&lease.pool, pool))
    }

    pub fn is_running(&self) -> bool {
        self.channel.child_running()
    }

    /// Run a command that raises no callbacks.
    pub fn call(&self, token: i32, payload: &[u8]) -> Result<(i64, Vec<u8>)> {
        self.call_with(token, payload, |tag, _| {
            warn!(tag, command = opcode::name(token), "unexpected callback");
            Vec::new()
        })
    }

    /// Run a command, answering its callbacks with `on_callback`. Returns
    /// the result value and payload.
    pub fn call_with(
        &self,
        token: i32,
        payload: &[u8],
        on_callback: impl FnMut(u32, &[u8]) -> Vec<u8>,
    ) -> Result<(i64, Vec<u8>)> {
        let pid = self.pid();
        debug!(pid, command = opcode::name(token), len = payload.len(), "worker call");
        let reply = Exchange::begin(&self.channel, token, payload)
            .and_then(|exchange| exchange.run(on_callback))
            .map_err(|e| {
                Error::WorkerFailed(format!("worker {pid} during {}: {e}", opcode::name(token)))
            })?;
        settle(pid, token, reply)
    }

    /// Hand the worker back to the pool. A no-op for directly forked
    /// workers, which are reaped when the handle drops.
    pub(crate) fn release(&mut self) -> Result<()> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        let reply = lease.pool.call(DELETE_FILEFORK, &lease.id.to_le_bytes());
        settle(lease.pool.pid().as_raw(), DELETE_FILEFORK, reply).map(|_| ())
    }
}

impl Drop for FileWorkerHandle {
    fn drop(&mut self) {
        let pid = self.pid();
        if let Err(e) = self.release() {
            warn!(pid, "cannot release pooled worker: {e}");
        }
    }
}

/// Turn a terminal reply into a value or an error.
pub(crate) fn settle(pid: i32, token: i32, reply: Reply) -> Result<(i64, Vec<u8>)> {
    match reply.kind() {
        ReplyKind::Value(value) => Ok((value, reply.payload)),
        ReplyKind::Failure { code, message } => {
            Err(Error::from_status(FileStatus::from_code(code), message))
        }
        ReplyKind::Lost => Err(Error::WorkerFailed(format!(
            "worker {pid} lost during {}",
            opcode::name(token)
        ))),
        ReplyKind::Callback { tag, .. } => Err(Error::Protocol(format!(
            "callback {tag} where the result of {} was expected",
            opcode::name(token)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn failures_keep_their_status() {
        let err = settle(7, opcode::OPEN_FILE, Reply::failure(FileStatus::IsXml.code(), "cut.xml"))
            .unwrap_err();
        assert_eq!(err.status(), FileStatus::IsXml);

        let err = settle(7, opcode::OPEN_FILE, Reply::failure(FileStatus::UserCanceled.code(), ""))
            .unwrap_err();
        assert_matches!(err, Error::UserCanceled);
    }

    #[test]
    fn lost_peer_is_a_worker_failure() {
        let err = settle(7, opcode::READ_FRAME, Reply::lost()).unwrap_err();
        assert!(err.is_worker_failure());
        assert!(err.to_string().contains("READ_FRAME"));
    }

    #[test]
    fn values_pass_through() {
        let (value, payload) = settle(7, opcode::GET_AUDIO_POSITION, Reply::ok(4410, vec![1])).unwrap();
        assert_eq!(value, 4410);
        assert_eq!(payload, [1]);
    }

    #[test]
    fn stray_callback_is_a_protocol_error() {
        let err = settle(7, opcode::READ_FRAME, Reply::callback(3, false, Vec::new())).unwrap_err();
        assert_matches!(err, Error::Protocol(_));
    }
}
