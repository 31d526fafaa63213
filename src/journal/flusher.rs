//! Flush worker: periodically forces the mapped write window so journalled
//! records reach stable storage between checkpoints. The interval is
//! re-read every tick, so `set_flush_interval` takes effect immediately.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};

use crate::journal::manager::JournalShared;

/// Body of the `journal-flusher` thread.
pub(crate) fn flusher_loop(shared: Arc<JournalShared>) {
    loop {
        {
            let mut core = shared.core.lock();
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            let interval = Duration::from_millis(core.tunables.flush_interval_ms);
            let _ = shared.work_cv.wait_for(&mut core, interval);
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        shared.flushing.store(true, Ordering::Release);
        let result = shared.core.lock().writer.force();
        shared.flushing.store(false, Ordering::Release);
        if let Err(e) = result {
            error!("journal flush failed: {:#}", e);
        }
    }
    debug!("journal flusher stopped");
}
