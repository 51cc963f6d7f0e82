//! A single long-lived worker thread.
//!
//! The worker publishes its index on the pool's ready channel whenever it is
//! idle, then blocks on its own job slot. Closing the slot (dropping the
//! sending half) is the termination signal.

use super::Job;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

/// What travels through a worker's job slot. `None` is a no-op tick.
pub(crate) type Slot = Option<Box<dyn Job>>;

/// Handle to a running worker thread.
pub(crate) struct Worker {
    id: usize,
    /// Sending half of the job slot. Taken on stop.
    slot: Option<SyncSender<Slot>>,
    /// Taken on stop; joining it is the stop acknowledgement.
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker that registers itself on `ready` between jobs.
    pub(crate) fn start(id: usize, ready: SyncSender<usize>) -> io::Result<Self> {
        // One hand-off at a time: a worker only registers when idle.
        let (slot_tx, slot_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(id, ready, slot_rx))?;

        Ok(Self {
            id,
            slot: Some(slot_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Hand a job to this worker.
    ///
    /// Only call after the worker announced itself on the ready channel.
    /// Returns the job back if the worker is gone.
    pub(crate) fn assign(&self, job: Slot) -> Result<(), Slot> {
        match &self.slot {
            Some(slot) => slot.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }

    /// Close the job slot and wait for the thread to exit.
    ///
    /// A job that is currently running is allowed to finish first.
    pub(crate) fn stop(&mut self) {
        drop(self.slot.take());

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "Worker thread panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn stopped(&self) -> bool {
        self.thread.is_none()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, ready: SyncSender<usize>, slot: Receiver<Slot>) {
    loop {
        // The dispatcher went away; nobody can hand us work anymore.
        if ready.send(id).is_err() {
            break;
        }

        match slot.recv() {
            Ok(Some(job)) => {
                trace!(worker = id, "Running job");
                if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                    error!(worker = id, "Job panicked");
                }
            }
            Ok(None) => trace!(worker = id, "Idle tick"),
            Err(_) => break,
        }
    }

    trace!(worker = id, "Worker exiting");
}
