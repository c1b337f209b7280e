//! Background reclamation
//!
//! The recycler consumes units of retired state: a buffer-list vector that
//! was replaced, and optionally the slice whose removal replaced it. Each
//! unit is stamped with the token serial current at publication; the worker
//! waits for every earlier token to retire before destroying the unit, so a
//! reader that snapshotted the old list never sees freed memory.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::index::buffer::SliceBuffer;
use crate::index::slice::Slice;
use crate::index::token::TokenManager;

/// Retired state awaiting destruction
pub struct RecycleUnit {
    buffers: Arc<Vec<Arc<SliceBuffer>>>,
    slice: Option<Arc<Slice>>,
    serial: u64,
}

impl RecycleUnit {
    pub fn new(
        buffers: Arc<Vec<Arc<SliceBuffer>>>,
        slice: Option<Arc<Slice>>,
        serial: u64,
    ) -> Self {
        Self {
            buffers,
            slice,
            serial,
        }
    }
}

struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Single background worker destroying retired slices and buffer lists
pub struct Recycler {
    sender: Mutex<Option<Sender<RecycleUnit>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    pending: Arc<Pending>,
}

impl Recycler {
    pub fn new(token_manager: Arc<TokenManager>) -> Self {
        let (sender, receiver) = unbounded();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });
        let worker = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("bitgrid-recycler".to_string())
                .spawn(move || Self::run(receiver, token_manager, pending))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => crate::fatal!("failed to spawn recycler worker: {}", e),
        };
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
        }
    }

    fn run(receiver: Receiver<RecycleUnit>, token_manager: Arc<TokenManager>, pending: Arc<Pending>) {
        while let Ok(unit) = receiver.recv() {
            token_manager.wait_until_tokens_before(unit.serial);

            let RecycleUnit { buffers, slice, .. } = unit;
            drop(buffers);
            if let Some(slice) = slice {
                drop(slice);
            }

            let mut count = pending.count.lock();
            *count -= 1;
            drop(count);
            pending.idle.notify_all();
        }
    }

    /// Queue a unit for destruction once its prior tokens retire
    pub fn schedule(&self, unit: RecycleUnit) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                *self.pending.count.lock() += 1;
                if sender.send(unit).is_err() {
                    // Worker died; the unit was moved into the send and its
                    // memory is reclaimed through the reference counts.
                    *self.pending.count.lock() -= 1;
                    tracing::warn!("recycler worker gone; unit dropped inline");
                }
            }
            None => {
                tracing::warn!("recycler is shut down; unit dropped inline");
            }
        }
    }

    /// Wait until every queued unit has been destroyed. Test support.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Stop the worker after it drains the queue
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("recycler worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn empty_list() -> Arc<Vec<Arc<SliceBuffer>>> {
        Arc::new(vec![Arc::new(SliceBuffer::new(16))])
    }

    #[test]
    fn test_unit_destroyed_after_prior_tokens_retire() {
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Recycler::new(Arc::clone(&token_manager));

        let token = token_manager.request_token();
        let list = empty_list();
        let probe = Arc::downgrade(&list);

        recycler.schedule(RecycleUnit::new(
            list,
            None,
            token_manager.serial_of_next_token(),
        ));

        // The token issued before the unit's serial pins it.
        assert!(!recycler.wait_until_idle(Duration::from_millis(100)));
        assert!(probe.upgrade().is_some());

        drop(token);
        assert!(recycler.wait_until_idle(Duration::from_secs(5)));
        assert!(probe.upgrade().is_none());
    }

    #[test]
    fn test_later_tokens_do_not_block() {
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Recycler::new(Arc::clone(&token_manager));

        let serial = token_manager.serial_of_next_token();
        let _later = token_manager.request_token();

        let list = empty_list();
        let probe = Arc::downgrade(&list);
        recycler.schedule(RecycleUnit::new(list, None, serial));

        assert!(recycler.wait_until_idle(Duration::from_secs(5)));
        assert!(probe.upgrade().is_none());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let token_manager = Arc::new(TokenManager::new());
        let recycler = Recycler::new(Arc::clone(&token_manager));

        let list = empty_list();
        let probe = Arc::downgrade(&list);
        recycler.schedule(RecycleUnit::new(
            list,
            None,
            token_manager.serial_of_next_token(),
        ));

        recycler.shutdown();
        assert!(probe.upgrade().is_none());

        // Scheduling after shutdown drops the unit without hanging.
        recycler.schedule(RecycleUnit::new(
            empty_list(),
            None,
            token_manager.serial_of_next_token(),
        ));
    }
}
