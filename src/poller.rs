use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{RecvTimeoutError, SyncSender, TrySendError},
        Arc,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerThreadConfig {
    /// Delay between task runs. `Duration::ZERO` runs the task only when woken up.
    pub interval: Duration,
    /// Maximum random amount subtracted from `interval` on every iteration.
    pub jitter: Duration,
}

/// A background thread that runs a task periodically.
///
/// Used for template polling and for metrics flushing.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Wakes the thread up before the interval elapses. Capacity is 1, so repeated wake ups
    /// coalesce.
    wake_sender: SyncSender<()>,

    stop_flag: Arc<AtomicBool>,
}

impl PollerThread {
    /// Spawn a thread named `name` that calls `task` after every interval (or wake up) until
    /// stopped. The first run happens after the first interval.
    pub(crate) fn start<F>(name: &str, config: PollerThreadConfig, mut task: F) -> Result<PollerThread>
    where
        F: FnMut() + Send + 'static,
    {
        let (wake_sender, wake_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let stop_flag = Arc::new(AtomicBool::new(false));

        let join_handle = {
            let stop_flag = Arc::clone(&stop_flag);
            let name = name.to_owned();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || loop {
                    let received = if config.interval.is_zero() {
                        wake_receiver.recv().map_err(|_| RecvTimeoutError::Disconnected)
                    } else {
                        wake_receiver.recv_timeout(jitter(config.interval, config.jitter))
                    };

                    match received {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            // The owning handle was dropped.
                            log::debug!(target: "togglr", thread:display = name; "owner dropped, exiting");
                            return;
                        }
                    }

                    if stop_flag.load(Ordering::Acquire) {
                        log::debug!(target: "togglr", thread:display = name; "received stop command");
                        return;
                    }

                    task();
                })?
        };

        Ok(PollerThread {
            join_handle,
            wake_sender,
            stop_flag,
        })
    }

    /// Run the task as soon as possible.
    pub(crate) fn wake(&self) {
        match self.wake_sender.try_send(()) {
            // Full means a wake up is already pending. Disconnected means the thread exited.
            Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Stop the thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub(crate) fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake();
    }

    /// Stop the thread and block waiting for it to exit. A task run in progress is completed
    /// first.
    pub(crate) fn shutdown(self) -> Result<()> {
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Subtract a random jitter of at most `jitter` from `interval`.
///
/// The result never drops below half of `interval`, so a misconfigured jitter cannot turn the
/// poller into a busy loop.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    let max_jitter = jitter.min(interval / 2);
    if max_jitter.is_zero() {
        return interval;
    }
    interval - thread_rng().gen_range(Duration::ZERO..=max_jitter)
}
