use crate::cli::*;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const REDRAW_MILLIS: u64 = 400;

/// Spinner tracking completed units of a long pipeline
/// step. Redrawn from a background thread until dropped.
pub struct Tracker {
    progress: Arc<Progress<DetailCounter>>,
    redraw: Option<JoinHandle<()>>,
}

impl Tracker {
    pub fn new(units: &'static str, total: usize) -> Self {
        let progress = Arc::new(Progress::new(DetailCounter::new(units)));
        progress.value.total.store(total);
        let redraw = progress
            .clone()
            .spawn_auto_update_thread(Duration::from_millis(REDRAW_MILLIS));
        Tracker {
            progress,
            redraw: Some(redraw),
        }
    }

    pub fn increment(&self) {
        self.progress.value.processed.fetch_add(1);
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.progress.finish();
        if self.redraw.take().unwrap().join().is_err() {
            eprintln!("Warning: progress thread panicked!");
        }
    }
}
