#[cfg(test)]
use std::{
    sync::mpsc::RecvTimeoutError,
    time::{Duration, Instant},
};
use std::sync::mpsc::{self, Receiver, Sender};

use crate::logging::DesktopLogger;

pub type UiTask<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Marshals work onto the thread that owns the UI state `S`.
pub trait UiDispatcher<S>: Send + Sync {
    fn run_on_ui_thread(&self, task_name: &str, task: UiTask<S>) -> Result<(), String>;
}

enum UiMessage<S> {
    Task { name: String, task: UiTask<S> },
    Quit(i32),
}

/// Single-threaded cooperative pump. Tasks run in submission order on the thread that calls
/// [`UiLoop::run_until_quit`] or [`UiLoop::pump_pending`].
pub struct UiLoop<S> {
    sender: Sender<UiMessage<S>>,
    receiver: Receiver<UiMessage<S>>,
    logger: DesktopLogger,
}

pub struct UiHandle<S> {
    sender: Sender<UiMessage<S>>,
}

impl<S> Clone for UiHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> UiHandle<S> {
    /// Asks the loop to return `exit_code` once the tasks queued before this call have run.
    pub fn request_quit(&self, exit_code: i32) {
        let _ = self.sender.send(UiMessage::Quit(exit_code));
    }
}

impl<S> UiDispatcher<S> for UiHandle<S> {
    fn run_on_ui_thread(&self, task_name: &str, task: UiTask<S>) -> Result<(), String> {
        self.sender
            .send(UiMessage::Task {
                name: task_name.to_string(),
                task,
            })
            .map_err(|_| format!("Failed to dispatch '{task_name}': UI loop has exited"))
    }
}

impl<S> UiLoop<S> {
    pub fn new(logger: DesktopLogger) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            logger,
        }
    }

    pub fn handle(&self) -> UiHandle<S> {
        UiHandle {
            sender: self.sender.clone(),
        }
    }

    /// Runs tasks until a quit request arrives and returns its exit code.
    pub fn run_until_quit(&self, state: &mut S) -> i32 {
        loop {
            // The loop holds a sender itself, so the channel never disconnects here.
            let Ok(message) = self.receiver.recv() else {
                return 0;
            };
            if let Some(exit_code) = self.handle_message(message, state) {
                return exit_code;
            }
        }
    }

    /// Runs everything already queued without blocking. Returns the number of tasks run,
    /// or the exit code when a quit request was reached.
    #[cfg(test)]
    pub fn pump_pending(&self, state: &mut S) -> Result<usize, i32> {
        let mut ran = 0;
        while let Ok(message) = self.receiver.try_recv() {
            if let Some(exit_code) = self.handle_message(message, state) {
                return Err(exit_code);
            }
            ran += 1;
        }
        Ok(ran)
    }

    /// Pumps until `done` holds or `timeout` elapses. Returns whether `done` held.
    #[cfg(test)]
    pub fn pump_until<P>(&self, state: &mut S, timeout: Duration, mut done: P) -> bool
    where
        P: FnMut(&S) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !done(state) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(message) => {
                    if self.handle_message(message, state).is_some() {
                        return done(state);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return done(state)
                }
            }
        }
        true
    }

    fn handle_message(&self, message: UiMessage<S>, state: &mut S) -> Option<i32> {
        match message {
            UiMessage::Task { name, task } => {
                self.logger.runtime(&format!("ui task: {name}"));
                task(state);
                None
            }
            UiMessage::Quit(exit_code) => Some(exit_code),
        }
    }
}
