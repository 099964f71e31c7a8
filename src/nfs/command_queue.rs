//! FIFO command queue served by one worker task.
//!
//! Every cache buffer owns one queue: loads and unloads of that buffer run
//! on its worker strictly in submission order, while callers continue.

use std::future::Future;
use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct CommandQueue<C> {
    command_sender: mpsc::UnboundedSender<C>,
}

impl<C: Send + 'static> CommandQueue<C> {
    /// Starts a worker that feeds every submitted command to `processor`.
    ///
    /// The worker stops when `processor` breaks or every handle to the queue
    /// is dropped.
    pub fn spawn<F, Fut>(name: String, mut processor: F) -> Self
    where
        F: FnMut(C) -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let (command_sender, mut command_receiver) = mpsc::unbounded_channel::<C>();

        tokio::spawn(async move {
            while let Some(command) = command_receiver.recv().await {
                if processor(command).await.is_break() {
                    break;
                }
            }
            trace!("Command queue {} finished", name);
        });

        Self { command_sender }
    }

    /// Queues `command` behind the ones already submitted.
    pub fn submit(&self, command: C) -> Result<()> {
        self.command_sender
            .send(command)
            .map_err(|_| Error::Protocol(String::from("buffer worker has exited")))
    }
}
