//! Harness side of one framed, bidirectional connection to a node.
//!
//! A transport (socket codec, in-process node, scripted test peer) owns the
//! [`RemoteEnd`]: it drains outbound [`Message`]s and feeds decoded
//! [`PeerEvent`]s back. The harness only ever sees the [`PeerConnection`].

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{controller::NodeController, message::Message, message::PeerEvent};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {0} is closed")]
    Closed(String),
}

/// The transport-facing halves of a connection.
pub struct RemoteEnd {
    /// Messages the harness sends to the node.
    pub commands: mpsc::UnboundedReceiver<Message>,
    /// Events the transport delivers to the harness.
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

pub struct PeerConnection {
    pub address: String,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    inbound: mpsc::UnboundedReceiver<PeerEvent>,
    closed: bool,
    controller: Option<Arc<dyn NodeController>>,
}

impl PeerConnection {
    pub fn new(
        address: impl Into<String>,
        outbound: mpsc::UnboundedSender<Message>,
        inbound: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        Self {
            address: address.into(),
            outbound: Some(outbound),
            inbound,
            closed: false,
            controller: None,
        }
    }

    /// A connection plus the remote end a transport should drive.
    pub fn pair(address: impl Into<String>) -> (Self, RemoteEnd) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Self::new(address, commands_tx, events_rx);
        let remote = RemoteEnd {
            commands: commands_rx,
            events: events_tx,
        };
        (conn, remote)
    }

    /// Attach the control-plane handle used for the idle check.
    pub fn with_controller(mut self, controller: Arc<dyn NodeController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn controller(&self) -> Option<&Arc<dyn NodeController>> {
        self.controller.as_ref()
    }

    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        let Some(outbound) = &self.outbound else {
            return Err(ConnectionError::Closed(self.address.clone()));
        };
        outbound.send(message).map_err(|_| ConnectionError::Closed(self.address.clone()))
    }

    /// Next inbound event, if one is queued. A transport that goes away
    /// without saying so is reported as a single `Closed` event.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        if self.closed {
            return None;
        }
        match self.inbound.try_recv() {
            Ok(PeerEvent::Closed) | Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Some(PeerEvent::Closed)
            }
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Stop sending. The transport notices the dropped sender and closes.
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }

    /// True once we have called [`disconnect`](Self::disconnect).
    pub fn is_disconnecting(&self) -> bool {
        self.outbound.is_none()
    }

    /// True once the transport has reported the connection closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
