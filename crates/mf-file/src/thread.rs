//! Background writers.
//!
//! A [`FileThread`] owns a ring of buffers. The owner fills one buffer at a
//! time and hands it to the writer thread, which writes it to the file and
//! returns it to the free list. Buffers move between the two over
//! `crossbeam-channel` queues; a buffer is only ever touched by one side.

use crossbeam_channel::{bounded, Receiver, Sender};
use mf_core::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

struct Job {
    slot: usize,
    len: usize,
}

pub struct FileThread<T> {
    name: &'static str,
    slots: Arc<[Mutex<T>]>,
    jobs: Option<Sender<Job>>,
    free: Receiver<usize>,
    current: Option<usize>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl<T: Send + 'static> FileThread<T> {
    /// Start a writer over `slots`. `write` receives a filled buffer and the
    /// number of valid entries in it.
    pub fn start<W>(name: &'static str, slots: Vec<T>, mut write: W) -> Result<Self>
    where
        W: FnMut(&T, usize) -> Result<()> + Send + 'static,
    {
        if slots.is_empty() {
            return Err(Error::Validation(format!("{name} writer needs at least one buffer")));
        }
        let count = slots.len();
        let slots: Arc<[Mutex<T>]> = slots.into_iter().map(Mutex::new).collect();
        let (jobs_tx, jobs_rx) = bounded::<Job>(count);
        let (free_tx, free_rx) = bounded::<usize>(count);
        for slot in 0..count {
            free_tx
                .send(slot)
                .map_err(|_| Error::state("free buffer queue closed"))?;
        }

        let ring = Arc::clone(&slots);
        let writer = thread::Builder::new()
            .name(format!("mf-{name}-writer"))
            .spawn(move || -> Result<()> {
                for job in jobs_rx {
                    write(&ring[job.slot].lock(), job.len)?;
                    if free_tx.send(job.slot).is_err() {
                        break;
                    }
                }
                Ok(())
            })?;
        debug!(name, buffers = count, "writer thread started");

        Ok(Self {
            name,
            slots,
            jobs: Some(jobs_tx),
            free: free_rx,
            current: None,
            writer: Some(writer),
        })
    }

    pub fn buffer_count(&self) -> usize {
        self.slots.len()
    }

    /// Index of the buffer to fill next, waiting for the writer to release
    /// one if all are queued.
    pub fn acquire(&mut self) -> Result<usize> {
        if let Some(slot) = self.current {
            return Ok(slot);
        }
        match self.free.recv() {
            Ok(slot) => {
                self.current = Some(slot);
                Ok(slot)
            }
            Err(_) => Err(self.writer_failure()),
        }
    }

    /// The acquired buffer.
    pub fn current(&self) -> Option<MutexGuard<'_, T>> {
        self.current.map(|slot| self.slots[slot].lock())
    }

    /// Every buffer, for describing the ring to another process. Only
    /// valid before anything was submitted.
    pub fn each_buffer(&self, mut visit: impl FnMut(&T)) {
        for slot in self.slots.iter() {
            visit(&slot.lock());
        }
    }

    /// Queue the acquired buffer with `len` valid entries.
    pub fn submit(&mut self, len: usize) -> Result<()> {
        let slot = self
            .current
            .take()
            .ok_or_else(|| Error::state(format!("no {} buffer was acquired", self.name)))?;
        let sent = match &self.jobs {
            Some(jobs) => jobs.send(Job { slot, len }).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(self.writer_failure())
        }
    }

    /// Drain queued buffers and join the writer, reporting its first error.
    pub fn stop(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.jobs.take());
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let result = writer
            .join()
            .map_err(|_| Error::state(format!("{} writer thread panicked", self.name)))?;
        debug!(name = self.name, "writer thread stopped");
        result
    }

    fn writer_failure(&mut self) -> Error {
        match self.finish() {
            Err(e) => e,
            Ok(()) => Error::state(format!("{} writer thread has stopped", self.name)),
        }
    }
}

impl<T> Drop for FileThread<T> {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(name = self.name, "writer failed: {e}"),
                Err(_) => warn!(name = self.name, "writer thread panicked"),
            }
        }
    }
}

/// A ring buffer handed out for filling: either a slot of a local writer
/// or the editor's mapping of a worker's slot.
pub enum BufferGuard<'a, T> {
    Local(MutexGuard<'a, T>),
    Mapped(&'a mut T),
}

impl<T> Deref for BufferGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            BufferGuard::Local(guard) => guard,
            BufferGuard::Mapped(buffer) => buffer,
        }
    }
}

impl<T> DerefMut for BufferGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            BufferGuard::Local(guard) => guard,
            BufferGuard::Mapped(buffer) => buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<(usize, Vec<u32>)>>>, impl FnMut(&Vec<u32>, usize) -> Result<()>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |buf: &Vec<u32>, len: usize| {
            sink.lock().push((len, buf[..len].to_vec()));
            Ok(())
        })
    }

    #[test]
    fn buffers_are_written_in_submission_order() {
        let (log, write) = recorder();
        let mut thread = FileThread::start("test", vec![vec![0u32; 4]; 2], write).unwrap();
        for round in 0..5u32 {
            thread.acquire().unwrap();
            let mut buf = thread.current().unwrap();
            buf.iter_mut().for_each(|v| *v = round);
            drop(buf);
            thread.submit(3).unwrap();
        }
        thread.stop().unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 5);
        for (round, (len, data)) in log.iter().enumerate() {
            assert_eq!(*len, 3);
            assert_eq!(data, &vec![round as u32; 3]);
        }
    }

    #[test]
    fn acquire_is_idempotent_until_submit() {
        let (_, write) = recorder();
        let mut thread = FileThread::start("test", vec![vec![0u32; 1]; 3], write).unwrap();
        let first = thread.acquire().unwrap();
        assert_eq!(thread.acquire().unwrap(), first);
        thread.submit(1).unwrap();
        assert!(thread.submit(1).is_err());
    }

    #[test]
    fn writer_error_surfaces_on_the_owner() {
        let mut thread = FileThread::start("test", vec![0u8; 1], |_: &u8, _| {
            Err(Error::encode("disk full"))
        })
        .unwrap();
        thread.acquire().unwrap();
        thread.submit(1).unwrap();
        // The single buffer never comes back.
        let err = thread.acquire().unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn empty_ring_is_rejected() {
        let result = FileThread::start("test", Vec::<u8>::new(), |_: &u8, _| Ok(()));
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
