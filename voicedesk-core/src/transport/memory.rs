//! In-process connector.
//!
//! Every `connect` call creates a [`MemoryPeer`] that plays the remote
//! agent: it injects inbound events and reads whatever the session sent.
//! Used by the tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Connector, LiveSetup, OutboundQueue, TransportEvent, TransportHandle, EVENT_CHANNEL_CAP};
use crate::codec::EncodedChunk;

/// Remote end of one in-memory session.
pub struct MemoryPeer {
    pub setup: LiveSetup,
    events: mpsc::Sender<TransportEvent>,
    outbound: Arc<OutboundQueue>,
    shutdown: watch::Receiver<bool>,
}

impl MemoryPeer {
    /// Deliver one inbound event. Returns `false` once the session has
    /// stopped listening.
    pub async fn send(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Everything the session has sent so far, in order.
    pub fn drain_outbound(&self) -> Vec<EncodedChunk> {
        std::iter::from_fn(|| self.outbound.try_pop()).collect()
    }

    /// Whether the session side has closed the transport.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.events.is_closed()
    }

    /// Wait until the session side closes the transport.
    pub async fn closed(&mut self) {
        while !*self.shutdown.borrow_and_update() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    peers: Mutex<VecDeque<MemoryPeer>>,
    open_on_connect: bool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Opened` as soon as a session connects.
    pub fn opening() -> Self {
        Self {
            peers: Mutex::new(VecDeque::new()),
            open_on_connect: true,
        }
    }

    /// Take the peer of the oldest unclaimed connection.
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().pop_front()
    }

    pub fn pending_peers(&self) -> usize {
        self.peers.lock().len()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, setup: &LiveSetup, outbound: Arc<OutboundQueue>) -> TransportHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if self.open_on_connect {
            let _ = events_tx.try_send(TransportEvent::Opened);
        }
        self.peers.lock().push_back(MemoryPeer {
            setup: setup.clone(),
            events: events_tx,
            outbound: Arc::clone(&outbound),
            shutdown: shutdown_rx,
        });
        TransportHandle::new(outbound, events_rx, shutdown_tx, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{OverflowPolicy, PushOutcome, TransportSender};

    fn queue() -> Arc<OutboundQueue> {
        Arc::new(OutboundQueue::new(8, OverflowPolicy::DropOldest))
    }

    #[tokio::test]
    async fn events_arrive_in_delivery_order() {
        let connector = MemoryConnector::new();
        let mut handle = connector.connect(&LiveSetup::default(), queue());
        let peer = connector.take_peer().expect("peer");

        let script = vec![
            TransportEvent::Opened,
            TransportEvent::Audio(EncodedChunk::from_wire("AAAA")),
            TransportEvent::OutputTranscript("hi".into()),
            TransportEvent::Interrupted,
            TransportEvent::TurnComplete,
        ];
        for event in script.clone() {
            assert!(peer.send(event).await);
        }

        let mut got = Vec::new();
        for _ in 0..script.len() {
            got.push(handle.next_event().await.expect("event"));
        }
        assert_eq!(got, script);
    }

    #[tokio::test]
    async fn sends_keep_order_and_close_is_visible_to_peer() {
        let connector = MemoryConnector::opening();
        let outbound = queue();
        let sender = TransportSender::new(Arc::clone(&outbound));
        let mut handle = connector.connect(&LiveSetup::default(), outbound);
        let mut peer = connector.take_peer().expect("peer");
        assert_eq!(handle.next_event().await, Some(TransportEvent::Opened));

        for tag in ["a", "b", "c"] {
            assert_eq!(sender.send(EncodedChunk::from_wire(tag)), PushOutcome::Queued);
        }
        let sent: Vec<_> = peer
            .drain_outbound()
            .into_iter()
            .map(EncodedChunk::into_string)
            .collect();
        assert_eq!(sent, vec!["a", "b", "c"]);

        handle.close();
        peer.closed().await;
        assert!(peer.is_closed());
        assert!(sender.is_closed());
        assert_eq!(sender.send(EncodedChunk::from_wire("late")), PushOutcome::Rejected);
        assert!(!peer.send(TransportEvent::TurnComplete).await);
    }
}
