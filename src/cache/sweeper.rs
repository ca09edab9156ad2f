//! Background expiry sweep
//!
//! A named thread that runs a task every `interval` until stopped. Stopping
//! wakes the thread immediately instead of waiting out the interval.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Handle to a running sweep thread
pub struct Sweeper {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start running `task` every `interval`
    pub fn spawn<F>(name: &str, interval: Duration, task: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread_name = format!("{name}-expiry");
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => task(),
                    _ => break,
                }
            })
            .map_err(|e| Error::io(format!("spawning {thread_name}"), e))?;
        debug!(thread = %thread_name, interval_secs = interval.as_secs(), "expiry sweeper started");
        Ok(Self {
            name: thread_name,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for the current pass to finish
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(thread = %self.name, "expiry sweeper panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
