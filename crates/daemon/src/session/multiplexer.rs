//! Session output multiplexer.
//!
//! Fans frames out to every connection attached to a session. Slow clients
//! never stall the session: each client has a bounded queue and frames are
//! dropped for that client alone when it fills up. Output history lives under
//! the same lock as the client table, so an attaching client is replayed
//! exactly the frames it would otherwise miss.

use std::collections::HashMap;

use parking_lot::Mutex;
use protocol::Frame;
use tokio::sync::mpsc;

use super::history::HistoryBuffer;

/// Unique identifier for an attached connection.
pub type ConnectionId = String;

/// Headroom on top of the history capacity, so a full replay never drops
/// frames for a freshly attached client.
pub const QUEUE_HEADROOM: usize = 256;

/// Outbound queue capacity for clients of a session with `history_capacity`.
pub fn queue_capacity(history_capacity: usize) -> usize {
    history_capacity.max(1) + QUEUE_HEADROOM
}

/// Statistics about a client's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total frames queued successfully.
    pub messages_sent: u64,
    /// Frames dropped because the client's queue was full.
    pub messages_dropped: u64,
    /// Whether the last send to this client was dropped.
    pub is_backpressured: bool,
}

/// A connection attached to a session.
///
/// Frames go into a bounded channel that the connection's writer drains.
#[derive(Debug)]
pub struct ClientHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    stats: ClientStats,
}

impl ClientHandle {
    /// Creates a handle together with the receiving half of its queue.
    pub fn with_capacity(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(id, tx), rx)
    }

    /// Wraps an existing queue, typically one shared with direct replies.
    pub fn from_sender(id: ConnectionId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            tx,
            stats: ClientStats::default(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn is_backpressured(&self) -> bool {
        self.stats.is_backpressured
    }

    /// Queues a frame without blocking.
    ///
    /// Returns true if the frame was queued, false if it was dropped.
    fn try_send(&mut self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(connection_id = %self.id, "Client recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        connection_id = %self.id,
                        dropped = self.stats.messages_dropped,
                        "Client is backpressured, dropping frames"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "Client channel closed");
                false
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Client count and history length observed atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutCounts {
    pub clients: usize,
    pub buffered: usize,
}

#[derive(Debug)]
struct Fanout {
    history: HistoryBuffer,
    clients: HashMap<ConnectionId, ClientHandle>,
}

impl Fanout {
    fn counts(&self) -> FanoutCounts {
        FanoutCounts {
            clients: self.clients.len(),
            buffered: self.history.len(),
        }
    }

    /// Sends to every client, pruning those whose receivers are gone.
    fn deliver(&mut self, frame: &Frame) -> usize {
        let mut disconnected = Vec::new();
        let mut delivered = 0;

        for (id, handle) in self.clients.iter_mut() {
            if handle.is_closed() {
                disconnected.push(id.clone());
                continue;
            }
            if handle.try_send(frame.clone()) {
                delivered += 1;
            }
        }

        for id in disconnected {
            self.clients.remove(&id);
            tracing::debug!(connection_id = %id, "Removed disconnected client");
        }

        delivered
    }
}

/// Per-session fan-out of frames to attached connections.
#[derive(Debug)]
pub struct SessionOutputBroadcaster {
    fanout: Mutex<Fanout>,
}

impl SessionOutputBroadcaster {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            fanout: Mutex::new(Fanout {
                history: HistoryBuffer::new(history_capacity),
                clients: HashMap::new(),
            }),
        }
    }

    /// Attaches a client and brings it up to date.
    ///
    /// `greeting` is built from the counts as they stand with the new client
    /// included, and is queued ahead of the replayed history. No frame
    /// published concurrently can be missed or duplicated. Returns the number
    /// of history frames replayed.
    pub fn attach<F>(&self, mut handle: ClientHandle, greeting: F) -> usize
    where
        F: FnOnce(FanoutCounts) -> Frame,
    {
        let mut fanout = self.fanout.lock();

        let mut counts = fanout.counts();
        if !fanout.clients.contains_key(handle.id()) {
            counts.clients += 1;
        }
        handle.try_send(greeting(counts));

        let mut replayed = 0;
        for frame in fanout.history.iter() {
            if handle.try_send(frame.clone()) {
                replayed += 1;
            }
        }

        tracing::debug!(
            connection_id = %handle.id(),
            replayed = replayed,
            "Attached client"
        );
        fanout.clients.insert(handle.id().clone(), handle);
        replayed
    }

    /// Removes a client, returning its statistics if it was attached.
    pub fn detach(&self, id: &ConnectionId) -> Option<ClientStats> {
        self.fanout.lock().clients.remove(id).map(|h| h.stats())
    }

    /// Records `frame` in history and delivers it to every client.
    ///
    /// Returns the number of clients the frame was queued for.
    pub fn publish(&self, frame: Frame) -> usize {
        let mut fanout = self.fanout.lock();
        fanout.history.push(frame.clone());
        fanout.deliver(&frame)
    }

    /// Delivers `frame` to every client without recording it.
    pub fn broadcast(&self, frame: Frame) -> usize {
        self.fanout.lock().deliver(&frame)
    }

    /// Drops every attached client.
    pub fn clear(&self) -> usize {
        let mut fanout = self.fanout.lock();
        let count = fanout.clients.len();
        fanout.clients.clear();
        count
    }

    pub fn counts(&self) -> FanoutCounts {
        self.fanout.lock().counts()
    }

    pub fn client_count(&self) -> usize {
        self.fanout.lock().clients.len()
    }

    pub fn history_len(&self) -> usize {
        self.fanout.lock().history.len()
    }

    pub fn client_stats(&self, id: &ConnectionId) -> Option<ClientStats> {
        self.fanout.lock().clients.get(id).map(|h| h.stats())
    }

    pub fn is_client_backpressured(&self, id: &ConnectionId) -> bool {
        self.fanout
            .lock()
            .clients
            .get(id)
            .map(|h| h.is_backpressured())
            .unwrap_or(false)
    }

    pub fn client_ids(&self) -> Vec<ConnectionId> {
        self.fanout.lock().clients.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn client(id: &str, capacity: usize) -> (ClientHandle, mpsc::Receiver<Frame>) {
        ClientHandle::with_capacity(id.to_string(), capacity)
    }

    fn hello(counts: FanoutCounts) -> Frame {
        Frame::error(format!("clients={} buffered={}", counts.clients, counts.buffered))
    }

    fn output_data(frame: &Frame) -> String {
        match frame {
            Frame::Output(output) => output.data.clone(),
            other => panic!("expected output, got {:?}", other),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed")
    }

    #[test]
    fn test_client_handle_creation() {
        let (handle, _rx) = client("client-1", 8);
        assert_eq!(handle.id(), "client-1");
        assert!(!handle.is_backpressured());
        assert_eq!(handle.stats(), ClientStats::default());
    }

    #[test]
    fn test_queue_capacity_includes_headroom() {
        assert_eq!(queue_capacity(1000), 1000 + QUEUE_HEADROOM);
        assert_eq!(queue_capacity(0), 1 + QUEUE_HEADROOM);
    }

    #[tokio::test]
    async fn test_attach_sends_greeting_before_history() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        broadcaster.publish(Frame::output("s", "first"));
        broadcaster.publish(Frame::output("s", "second"));

        let (handle, mut rx) = client("late", 32);
        let replayed = broadcaster.attach(handle, hello);
        assert_eq!(replayed, 2);

        assert_eq!(recv(&mut rx).await, Frame::error("clients=1 buffered=2"));
        assert_eq!(output_data(&recv(&mut rx).await), "first");
        assert_eq!(output_data(&recv(&mut rx).await), "second");
    }

    #[tokio::test]
    async fn test_reattach_same_id_does_not_inflate_count() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        let (first, _rx1) = client("conn", 8);
        broadcaster.attach(first, hello);

        let (again, mut rx2) = client("conn", 8);
        broadcaster.attach(again, hello);

        assert_eq!(recv(&mut rx2).await, Frame::error("clients=1 buffered=0"));
        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        let (a, _rx_a) = client("a", 8);
        let (b, _rx_b) = client("b", 8);
        broadcaster.attach(a, hello);
        broadcaster.attach(b, hello);
        assert_eq!(broadcaster.client_count(), 2);

        assert!(broadcaster.detach(&"a".to_string()).is_some());
        assert_eq!(broadcaster.client_count(), 1);
        assert!(broadcaster.detach(&"nonexistent".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_client_in_order() {
        let broadcaster = SessionOutputBroadcaster::new(100);
        let mut receivers = Vec::new();
        for id in ["c1", "c2", "c3"] {
            let (handle, mut rx) = client(id, 64);
            broadcaster.attach(handle, hello);
            let _ = recv(&mut rx).await;
            receivers.push(rx);
        }

        for i in 0..20 {
            assert_eq!(broadcaster.publish(Frame::output("s", format!("chunk-{:03}", i))), 3);
        }

        for rx in receivers.iter_mut() {
            for i in 0..20 {
                assert_eq!(output_data(&recv(rx).await), format!("chunk-{:03}", i));
            }
        }
        for id in ["c1", "c2", "c3"] {
            let stats = broadcaster.client_stats(&id.to_string()).unwrap();
            assert_eq!(stats.messages_sent, 21);
            assert_eq!(stats.messages_dropped, 0);
        }
    }

    #[tokio::test]
    async fn test_broadcast_is_not_recorded() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        broadcaster.broadcast(Frame::input_echo("s", "ls\n"));
        assert_eq!(broadcaster.history_len(), 0);
        broadcaster.publish(Frame::output("s", "x"));
        assert_eq!(broadcaster.history_len(), 1);
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let broadcaster = SessionOutputBroadcaster::new(100);
        let (fast, mut rx_fast) = client("fast", 64);
        let (slow, _rx_slow) = client("slow", 2);
        broadcaster.attach(fast, hello);
        broadcaster.attach(slow, hello);
        let _ = recv(&mut rx_fast).await;

        for i in 0..10 {
            broadcaster.publish(Frame::output("s", format!("message-{}", i)));
            let _ = recv(&mut rx_fast).await;
        }

        let slow_stats = broadcaster.client_stats(&"slow".to_string()).unwrap();
        assert!(slow_stats.messages_dropped > 0);
        assert!(broadcaster.is_client_backpressured(&"slow".to_string()));

        let fast_stats = broadcaster.client_stats(&"fast".to_string()).unwrap();
        assert_eq!(fast_stats.messages_dropped, 0);
        assert!(!broadcaster.is_client_backpressured(&"fast".to_string()));
    }

    #[tokio::test]
    async fn test_backpressure_recovers() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        let (handle, mut rx) = client("c", 1);
        broadcaster.attach(handle, hello);
        broadcaster.broadcast(Frame::output("s", "dropped"));
        assert!(broadcaster.is_client_backpressured(&"c".to_string()));

        let _ = recv(&mut rx).await;
        broadcaster.broadcast(Frame::output("s", "queued"));
        assert!(!broadcaster.is_client_backpressured(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_disconnected_client_removal() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        let (stays, _rx_stays) = client("stays", 8);
        let (drops, rx_drops) = client("drops", 8);
        broadcaster.attach(stays, hello);
        broadcaster.attach(drops, hello);
        drop(rx_drops);

        broadcaster.publish(Frame::output("s", "test"));

        assert_eq!(broadcaster.client_ids(), vec!["stays".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_publish_and_attach_never_loses_frames() {
        let broadcaster = Arc::new(SessionOutputBroadcaster::new(1000));
        let publisher = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 0..200 {
                    broadcaster.publish(Frame::output("s", i.to_string()));
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::task::yield_now().await;
        let (handle, mut rx) = client("joiner", queue_capacity(1000));
        broadcaster.attach(handle, hello);
        publisher.await.unwrap();

        let _greeting = recv(&mut rx).await;
        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seen.push(output_data(&frame).parse::<u32>().unwrap());
        }
        let expected: Vec<u32> = (0..200).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_clear_drops_all_clients() {
        let broadcaster = SessionOutputBroadcaster::new(10);
        let (a, mut rx) = client("a", 8);
        broadcaster.attach(a, hello);
        assert_eq!(broadcaster.clear(), 1);
        assert_eq!(broadcaster.client_count(), 0);

        let _ = recv(&mut rx).await;
        assert!(rx.recv().await.is_none());
    }
}
