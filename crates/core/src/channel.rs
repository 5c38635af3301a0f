//! Message-passing plumbing between a bridge controller and a transport driver.
//!
//! Each peer connection is split in two halves. The controller keeps the
//! [`ChannelHandle`]: it enqueues commands without blocking and receives the
//! peer's audio and control events, in arrival order, from a single queue.
//! The driver task that owns the socket keeps the [`ChannelEndpoint`].

use crate::generic_types::{ChannelEvent, ControlEvent};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

/// Capacity of the driver -> controller event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 128;

/// Creates a connected handle/endpoint pair for a channel named `label`.
pub fn pair<C>(label: &'static str) -> (ChannelHandle<C>, ChannelEndpoint<C>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handle = ChannelHandle {
        label,
        commands: Some(command_tx),
        events: event_rx,
        injector: event_tx.downgrade(),
        driver: None,
        exhausted: false,
    };
    let endpoint = ChannelEndpoint {
        commands: command_rx,
        events: event_tx,
    };
    (handle, endpoint)
}

/// Controller-side half of a channel.
#[derive(Debug)]
pub struct ChannelHandle<C> {
    label: &'static str,
    commands: Option<mpsc::UnboundedSender<C>>,
    events: mpsc::Receiver<ChannelEvent>,
    injector: mpsc::WeakSender<ChannelEvent>,
    driver: Option<JoinHandle<()>>,
    exhausted: bool,
}

/// Driver-side half of a channel.
#[derive(Debug)]
pub struct ChannelEndpoint<C> {
    /// Commands from the controller. Yields `None` once the controller closed the channel.
    pub commands: mpsc::UnboundedReceiver<C>,
    /// Events for the controller.
    pub events: mpsc::Sender<ChannelEvent>,
}

impl<C> ChannelEndpoint<C> {
    /// Forwards an event to the controller. Returns `false` if it is gone.
    pub async fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

impl<C> ChannelHandle<C> {
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Ties the driver task's lifetime to this handle.
    pub fn attach_driver(&mut self, driver: JoinHandle<()>) {
        self.driver = Some(driver);
    }

    /// Non-blocking enqueue. Returns `false` when the channel is closed.
    pub fn send(&self, command: C) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_none()
    }

    /// A sender that can inject events into this channel from elsewhere in the
    /// process (for example a call-control webhook) without keeping it alive.
    pub fn injector(&self) -> mpsc::WeakSender<ChannelEvent> {
        self.injector.clone()
    }

    /// Next event from the peer.
    ///
    /// If the driver goes away without saying so, a single `ChannelClosed` is
    /// synthesized. After that the future never resolves.
    pub async fn recv(&mut self) -> ChannelEvent {
        if self.exhausted {
            return std::future::pending().await;
        }
        match self.events.recv().await {
            Some(event) => {
                if matches!(event, ChannelEvent::Control(ControlEvent::ChannelClosed { .. })) {
                    self.exhausted = true;
                }
                event
            }
            None => {
                self.exhausted = true;
                ChannelEvent::Control(ControlEvent::ChannelClosed {
                    error: Some(format!("{} driver stopped", self.label)),
                })
            }
        }
    }

    /// Closes the channel. Idempotent.
    ///
    /// Dropping the command sender tells the driver to flush what is queued and
    /// shut its socket. The driver gets at most `timeout` to do so before it is
    /// aborted.
    pub async fn close(&mut self, timeout: Duration) {
        if self.commands.take().is_none() && self.driver.is_none() {
            return;
        }
        self.events.close();
        let Some(mut driver) = self.driver.take() else {
            debug!(channel = self.label, "Channel closed");
            return;
        };
        match tokio::time::timeout(timeout, &mut driver).await {
            Ok(_) => debug!(channel = self.label, "Channel driver finished"),
            Err(_) => {
                warn!(channel = self.label, ?timeout, "Channel driver unresponsive, aborting");
                driver.abort();
            }
        }
    }
}

impl<C> Drop for ChannelHandle<C> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
