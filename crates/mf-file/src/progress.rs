//! Progress reporting across the worker boundary.
//!
//! Inside a worker, [`LinkProgress`] turns every [`ProgressSink`] call into
//! a callback result on the command in flight. The editor side hands those
//! callbacks to its own sink with [`relay_progress`].

use mf_core::{ByteReader, ProgressSink};
use mf_ipc::ChildLink;
use tracing::{debug, warn};

use crate::opcode::{
    PROGRESS_CANCELED, START_PROGRESS, STOP_PROGRESS, UPDATE_PROGRESS, UPDATE_PROGRESS_TITLE,
};
use crate::payload::{self, ProgressStart};

/// A sink that reports to the parent of a worker.
pub struct LinkProgress<'a> {
    link: &'a mut ChildLink,
    broken: bool,
}

impl<'a> LinkProgress<'a> {
    pub fn new(link: &'a mut ChildLink) -> Self {
        Self {
            link,
            broken: false,
        }
    }

    fn send(&mut self, tag: u32, payload: &[u8]) {
        if self.broken {
            return;
        }
        if let Err(e) = self.link.callback(tag, payload) {
            warn!(tag, "progress callback failed: {e}");
            self.broken = true;
        }
    }
}

impl ProgressSink for LinkProgress<'_> {
    fn start(&mut self, title: &str, total: i64) {
        let start = ProgressStart {
            total,
            title: title.to_string(),
        };
        match payload::encode(&start) {
            Ok(bytes) => self.send(START_PROGRESS, &bytes),
            Err(e) => warn!("{e}"),
        }
    }

    fn update(&mut self, value: i64) {
        self.send(UPDATE_PROGRESS, &value.to_le_bytes());
    }

    fn update_title(&mut self, title: &str) {
        self.send(UPDATE_PROGRESS_TITLE, title.as_bytes());
    }

    /// A parent that stopped answering counts as a cancellation.
    fn is_cancelled(&mut self) -> bool {
        if self.broken {
            return true;
        }
        match self.link.request(PROGRESS_CANCELED, &[]) {
            Ok(answer) => answer.first().is_some_and(|&b| b != 0),
            Err(e) => {
                warn!("cancellation query failed: {e}");
                self.broken = true;
                true
            }
        }
    }

    fn stop(&mut self, title: &str) {
        self.send(STOP_PROGRESS, title.as_bytes());
    }
}

/// Apply a progress callback from a worker to `progress`. Returns the
/// continuation payload, or `None` when `tag` is not a progress callback.
pub fn relay_progress(progress: &mut dyn ProgressSink, tag: u32, body: &[u8]) -> Option<Vec<u8>> {
    match tag {
        START_PROGRESS => {
            match payload::decode::<ProgressStart>(body) {
                Ok(start) => progress.start(&start.title, start.total),
                Err(e) => warn!("bad START_PROGRESS: {e}"),
            }
            Some(Vec::new())
        }
        UPDATE_PROGRESS => {
            match ByteReader::new(body).i64() {
                Ok(value) => progress.update(value),
                Err(e) => warn!("bad UPDATE_PROGRESS: {e}"),
            }
            Some(Vec::new())
        }
        UPDATE_PROGRESS_TITLE => {
            progress.update_title(&String::from_utf8_lossy(body));
            Some(Vec::new())
        }
        PROGRESS_CANCELED => Some(vec![u8::from(progress.is_cancelled())]),
        STOP_PROGRESS => {
            progress.stop(&String::from_utf8_lossy(body));
            Some(Vec::new())
        }
        other => {
            debug!(tag = other, "not a progress callback");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        cancel: bool,
    }

    impl ProgressSink for Recorder {
        fn start(&mut self, title: &str, total: i64) {
            self.events.push(format!("start {title} {total}"));
        }
        fn update(&mut self, value: i64) {
            self.events.push(format!("update {value}"));
        }
        fn update_title(&mut self, title: &str) {
            self.events.push(format!("title {title}"));
        }
        fn is_cancelled(&mut self) -> bool {
            self.cancel
        }
        fn stop(&mut self, title: &str) {
            self.events.push(format!("stop {title}"));
        }
    }

    #[test]
    fn callbacks_reach_the_sink() {
        let mut sink = Recorder::default();
        let start = payload::encode(&ProgressStart {
            total: 900,
            title: "Building table of contents".into(),
        })
        .unwrap();
        relay_progress(&mut sink, START_PROGRESS, &start);
        relay_progress(&mut sink, UPDATE_PROGRESS, &450i64.to_le_bytes());
        relay_progress(&mut sink, UPDATE_PROGRESS_TITLE, b"Indexing audio");
        relay_progress(&mut sink, STOP_PROGRESS, b"done");
        assert_eq!(
            sink.events,
            [
                "start Building table of contents 900",
                "update 450",
                "title Indexing audio",
                "stop done"
            ]
        );
    }

    #[test]
    fn cancellation_is_one_byte() {
        let mut sink = Recorder::default();
        assert_eq!(relay_progress(&mut sink, PROGRESS_CANCELED, &[]), Some(vec![0]));
        sink.cancel = true;
        assert_eq!(relay_progress(&mut sink, PROGRESS_CANCELED, &[]), Some(vec![1]));
        assert_eq!(relay_progress(&mut sink, 999, &[]), None);
    }
}
