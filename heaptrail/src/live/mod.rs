//! Background consumer for live captures
//!
//! A [`BackgroundReader`] owns a decoder and a dedicated worker thread that
//! drains `next_allocation` into a mutex-protected vector, while the
//! foreground thread takes periodic snapshots. The worker exits when the
//! stream ends, the source is cancelled from outside, or the stream turns
//! out to be malformed; accumulated allocations stay queryable in every
//! case.

use crate::analysis::{snapshot_at, SnapshotRow};
use crate::io::SocketCancel;
use crate::reader::{Allocation, RecordReader, TraceContext};
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub struct BackgroundReader {
    allocations: Arc<Mutex<Vec<Allocation>>>,
    active: Arc<AtomicBool>,
    context: TraceContext,
    cancel: Option<SocketCancel>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundReader {
    /// Spawn the worker thread draining `reader`. When a `cancel` handle is
    /// provided, dropping the `BackgroundReader` closes the source through
    /// it so the join cannot block on a quiet socket.
    #[must_use]
    pub fn spawn(mut reader: RecordReader, cancel: Option<SocketCancel>) -> BackgroundReader {
        let allocations = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicBool::new(true));
        let context = reader.context();

        let worker_allocations = Arc::clone(&allocations);
        let worker_active = Arc::clone(&active);
        let worker = std::thread::Builder::new()
            .name("heaptrail-live".to_string())
            .spawn(move || {
                loop {
                    match reader.next_allocation() {
                        Ok(Some(allocation)) => {
                            worker_allocations.lock().unwrap().push(allocation);
                        }
                        Ok(None) => {
                            info!("live capture stream ended");
                            break;
                        }
                        Err(e) => {
                            error!("live capture decode failed: {e}");
                            break;
                        }
                    }
                }
                worker_active.store(false, Ordering::Release);
            })
            .expect("failed to spawn live reader thread");

        BackgroundReader { allocations, active, context, cancel, worker: Some(worker) }
    }

    /// True while the worker thread is still draining the source.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of allocations materialized so far.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    /// Snapshot of the currently live allocations, replaying everything
    /// decoded so far. The snapshot reflects a prefix of the stream
    /// consistent with wire order.
    #[must_use]
    pub fn snapshot(&self, merge_threads: bool) -> Vec<SnapshotRow> {
        let allocations = self.allocations.lock().unwrap();
        if allocations.is_empty() {
            return Vec::new();
        }
        snapshot_at(&allocations, allocations.len() - 1, merge_threads)
    }

    /// Trace-rendering handle over the worker's decoder state.
    #[must_use]
    pub fn context(&self) -> TraceContext {
        self.context.clone()
    }
}

impl Drop for BackgroundReader {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.close();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
