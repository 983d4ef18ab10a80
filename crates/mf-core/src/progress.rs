//! Progress reporting for long-running operations.
//!
//! Table-of-contents construction is the only operation that reports
//! progress. The caller passes a [`ProgressSink`] into `open_file`; inside a
//! worker process the sink relays every call to the parent.

/// Receiver of progress updates. `is_cancelled` is polled between batches
/// of work and lets the user abort.
pub trait ProgressSink {
    fn start(&mut self, title: &str, total: i64);
    fn update(&mut self, value: i64);
    fn update_title(&mut self, title: &str);
    fn is_cancelled(&mut self) -> bool;
    fn stop(&mut self, title: &str);
}

/// Discards every update and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn start(&mut self, _title: &str, _total: i64) {}
    fn update(&mut self, _value: i64) {}
    fn update_title(&mut self, _title: &str) {}
    fn is_cancelled(&mut self) -> bool {
        false
    }
    fn stop(&mut self, _title: &str) {}
}

/// Logs progress through `tracing` in ten percent steps.
#[derive(Debug, Default)]
pub struct LogProgress {
    title: String,
    total: i64,
    last_decile: i64,
}

impl ProgressSink for LogProgress {
    fn start(&mut self, title: &str, total: i64) {
        self.title = title.to_string();
        self.total = total;
        self.last_decile = 0;
        tracing::info!("{title}");
    }

    fn update(&mut self, value: i64) {
        if self.total <= 0 {
            return;
        }
        let decile = (value.clamp(0, self.total) * 10) / self.total;
        if decile > self.last_decile {
            self.last_decile = decile;
            tracing::info!("{}: {}%", self.title, decile * 10);
        }
    }

    fn update_title(&mut self, title: &str) {
        self.title = title.to_string();
    }

    fn is_cancelled(&mut self) -> bool {
        false
    }

    fn stop(&mut self, title: &str) {
        tracing::info!("{title}");
    }
}
