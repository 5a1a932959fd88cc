use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SyncError};
use crate::types::Device;

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    Run(Job),
    /// Reply with the first error held since the last sync.
    Sync(oneshot::Sender<Option<SyncError>>),
}

/// An execution stream backed by one worker thread.
///
/// Work is queued and runs in submission order. A failing job does not stop
/// later ones; its error is held until the next [`synchronize`](Self::synchronize).
pub struct HostStream {
    device: Device,
    tx: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    pub fn new(device: Device, thread_prefix: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let worker = std::thread::Builder::new()
            .name(format!("{thread_prefix}-stream{}", device.ordinal))
            .spawn(move || {
                let mut first_error = None;
                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        Command::Run(job) => {
                            if let Err(e) = job() {
                                tracing::debug!(%device, "stream job failed: {e}");
                                first_error.get_or_insert(e);
                            }
                        }
                        Command::Sync(done) => {
                            let _ = done.send(first_error.take());
                        }
                    }
                }
            })?;
        Ok(Self {
            device,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Queue `job` behind all previously queued work.
    pub fn enqueue(&self, job: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.send(Command::Run(Box::new(job)))
    }

    /// Block until all queued work has run, then report the first error any
    /// of it produced since the last synchronize.
    ///
    /// Must not be called from inside an async runtime.
    pub fn synchronize(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Sync(done_tx))?;
        match done_rx.blocking_recv().map_err(|_| self.worker_gone())? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| self.worker_gone())?
            .send(cmd)
            .map_err(|_| self.worker_gone())
    }

    fn worker_gone(&self) -> SyncError {
        SyncError::collective("host stream", format!("worker for {} exited", self.device))
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // closing the channel ends the worker loop once the queue drains
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(device = %self.device, "host stream worker panicked");
            }
        }
    }
}
