// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-message dispatch.
//!
//! Each decoded message produces zero or one reply. Runs of consecutive
//! data messages are stored and broadcast as one batch.

use crate::registry::Registry;
use crate::server::ConnectionHandle;
use crate::stream::SharedStream;

use std::sync::Arc;
use tracing::{debug, info, warn};
use watcher::{Message, Payload, StatusKind, PROTOCOL_VERSION};

/// Connection-local state seen by the handler.
pub struct Session {
    conn: Arc<ConnectionHandle>,
    stream: Option<Arc<SharedStream>>,
}

impl Session {
    pub fn new(conn: Arc<ConnectionHandle>) -> Self {
        Self { conn, stream: None }
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.conn
    }

    pub fn stream(&self) -> Option<&Arc<SharedStream>> {
        self.stream.as_ref()
    }
}

/// Stateless dispatcher shared by all connections.
pub struct MessageHandler {
    registry: Arc<Registry>,
    read_only: bool,
}

impl MessageHandler {
    pub fn new(registry: Arc<Registry>, read_only: bool) -> Self {
        Self {
            registry,
            read_only,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one decoded frame, returning the replies in order.
    pub fn handle_batch(&self, session: &mut Session, messages: Vec<Message>) -> Vec<Message> {
        let mut replies = Vec::new();
        let mut data = Vec::new();

        for msg in messages {
            if msg.is_data() {
                data.push(msg);
                continue;
            }
            if !data.is_empty() {
                replies.extend(self.handle_data(std::mem::take(&mut data)));
            }
            replies.extend(self.handle(session, msg));
        }
        if !data.is_empty() {
            replies.extend(self.handle_data(data));
        }
        replies
    }

    /// Handle a single message.
    pub fn handle(&self, session: &mut Session, msg: Message) -> Option<Message> {
        if msg.is_data() {
            return self.handle_data(vec![msg]);
        }

        match msg.payload {
            Payload::Hello { version } => {
                if version == PROTOCOL_VERSION {
                    debug!("Client {} speaks protocol {}", session.conn.peer_addr(), version);
                    Some(Message::new(Payload::Hello {
                        version: PROTOCOL_VERSION,
                    }))
                } else {
                    warn!(
                        "Client {} speaks protocol {}, expected {}",
                        session.conn.peer_addr(),
                        version,
                        PROTOCOL_VERSION
                    );
                    Some(Message::status(StatusKind::Nack))
                }
            }
            Payload::Start => {
                self.stream_for(session).start();
                None
            }
            Payload::Stop => {
                self.stream_for(session).stop();
                None
            }
            Payload::Seek(position) => {
                self.stream_for(session).seek(position);
                None
            }
            Payload::Speed(speed) => {
                if let Err(e) = self.stream_for(session).set_speed(speed) {
                    warn!("Rejected speed request from {}: {}", session.conn.peer_addr(), e);
                }
                None
            }
            Payload::PlaybackTimeRange { .. } => Some(match session.stream() {
                Some(stream) => stream.range(),
                None => self.range(),
            }),
            Payload::ListStreams(_) => {
                Some(Message::new(Payload::ListStreams(self.registry.list_streams())))
            }
            Payload::SubscribeStream(uid) => Some(self.subscribe_stream(session, uid)),
            Payload::StreamDescription(description) => {
                self.stream_for(session).set_description(description);
                Some(Message::status(StatusKind::Ack))
            }
            Payload::Status(kind) => {
                debug!("Status {:?} from {}", kind, session.conn.peer_addr());
                None
            }
            Payload::Unknown { tag, .. } => {
                warn!(
                    "Ignoring unknown message type {} from {}",
                    tag,
                    session.conn.peer_addr()
                );
                None
            }
            other => {
                debug!("Unexpected {} from {}", other.message_type(), session.conn.peer_addr());
                None
            }
        }
    }

    /// Detach the session from its stream when the connection ends.
    pub fn disconnect(&self, session: &mut Session) {
        if let Some(stream) = session.stream.take() {
            self.leave(session, &stream);
        }
    }

    /// Unsubscribe the session, dropping the stream if it was private to it.
    fn leave(&self, session: &Session, stream: &SharedStream) {
        stream.remove_subscriber(session.conn.id());
        self.registry.remove_if_abandoned(stream);
    }

    fn handle_data(&self, data: Vec<Message>) -> Option<Message> {
        let mut reply = None;
        if !self.read_only {
            if let Err(e) = self.registry.store().append_batch(&data) {
                warn!("Failed to store {} events: {}", data.len(), e);
                reply = Some(Message::status(StatusKind::Nack));
            }
        }
        self.registry.broadcast_live(&data);
        reply
    }

    fn range(&self) -> Message {
        let (min, max) = match self.registry.store().event_range() {
            Ok(range) => range.unwrap_or((0, 0)),
            Err(e) => {
                warn!("Could not read history range: {}", e);
                (0, 0)
            }
        };
        Message::new(Payload::PlaybackTimeRange { min, max })
    }

    fn subscribe_stream(&self, session: &mut Session, uid: u32) -> Message {
        let Some(target) = self.registry.get_stream(uid) else {
            warn!("Client {} asked for unknown stream {}", session.conn.peer_addr(), uid);
            return Message::status(StatusKind::Nack);
        };
        if let Some(current) = session.stream.take() {
            if current.uid() == uid {
                session.stream = Some(current);
                return Message::status(StatusKind::Ack);
            }
            self.leave(session, &current);
        }
        target.add_subscriber(&session.conn);
        info!("Client {} joined stream {}", session.conn.peer_addr(), uid);
        session.stream = Some(target);
        Message::status(StatusKind::Ack)
    }

    /// The session's stream, creating and joining a fresh one if needed.
    fn stream_for(&self, session: &mut Session) -> Arc<SharedStream> {
        if let Some(stream) = &session.stream {
            return stream.clone();
        }
        let stream = self.registry.create_stream();
        stream.add_subscriber(&session.conn);
        session.stream = Some(stream.clone());
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayConfig;
    use std::net::SocketAddr;
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;
    use watcher::{GpsMessage, SeekPosition, StreamInfo};
    use watcher_store::{Direction, EventStore, MemoryStore, StoreError};

    struct Fixture {
        handler: MessageHandler,
        store: Arc<MemoryStore>,
    }

    fn fixture(read_only: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone(), ReplayConfig::default(), Handle::current());
        Fixture {
            handler: MessageHandler::new(registry, read_only),
            store,
        }
    }

    fn session(id: u64) -> (Session, mpsc::Receiver<Vec<Message>>) {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (conn, rx) = ConnectionHandle::new(id, peer, 64);
        (Session::new(conn), rx)
    }

    fn gps(ts: i64) -> Message {
        Message::at(
            ts,
            Payload::Gps(GpsMessage {
                node: "192.168.1.7".parse().unwrap(),
                lat: 40.0,
                lng: -75.0,
                alt: 0.0,
            }),
        )
    }

    fn status(reply: Option<Message>) -> Option<StatusKind> {
        match reply?.payload {
            Payload::Status(kind) => Some(kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_hello_version_check() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);

        let reply = f
            .handler
            .handle(&mut s, Message::new(Payload::Hello { version: PROTOCOL_VERSION }));
        assert!(matches!(reply.unwrap().payload, Payload::Hello { version } if version == PROTOCOL_VERSION));

        let reply = f.handler.handle(
            &mut s,
            Message::new(Payload::Hello {
                version: PROTOCOL_VERSION + 1,
            }),
        );
        assert_eq!(status(reply), Some(StatusKind::Nack));
    }

    #[tokio::test]
    async fn test_data_is_stored_and_broadcast() {
        let f = fixture(false);
        let (mut watcher, mut rx) = session(1);
        let (mut feeder, _feeder_rx) = session(2);

        assert!(f.handler.handle(&mut watcher, Message::new(Payload::Start)).is_none());

        let replies = f.handler.handle_batch(&mut feeder, vec![gps(10), gps(20)]);
        assert!(replies.is_empty());
        assert_eq!(f.store.count().unwrap(), 2);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].timestamp, 20);
    }

    #[tokio::test]
    async fn test_read_only_skips_store() {
        let f = fixture(true);
        let (mut watcher, mut rx) = session(1);
        let (mut feeder, _feeder_rx) = session(2);
        f.handler.handle(&mut watcher, Message::new(Payload::Start));

        assert!(f.handler.handle(&mut feeder, gps(10)).is_none());
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(rx.recv().await.unwrap()[0].timestamp, 10);
    }

    #[tokio::test]
    async fn test_control_creates_stream_once() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);

        f.handler.handle(&mut s, Message::new(Payload::Start));
        f.handler.handle(&mut s, Message::new(Payload::Seek(SeekPosition::Eof)));
        f.handler.handle(&mut s, Message::new(Payload::Speed(2.0)));

        assert_eq!(f.handler.registry().stream_count(), 1);
        let stream = s.stream().unwrap();
        assert!(stream.is_live() && stream.is_playing());
    }

    #[tokio::test]
    async fn test_description_and_listing() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);

        let reply = f.handler.handle(
            &mut s,
            Message::new(Payload::StreamDescription("night shift".into())),
        );
        assert_eq!(status(reply), Some(StatusKind::Ack));

        let reply = f
            .handler
            .handle(&mut s, Message::new(Payload::ListStreams(vec![])))
            .unwrap();
        match reply.payload {
            Payload::ListStreams(streams) => {
                assert_eq!(
                    streams,
                    vec![StreamInfo {
                        uid: s.stream().unwrap().uid(),
                        description: "night shift".into()
                    }]
                );
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_stream_moves_session() {
        let f = fixture(false);
        let (mut a, _rx_a) = session(1);
        let (mut b, _rx_b) = session(2);

        f.handler.handle(&mut a, Message::new(Payload::Start));
        let shared = a.stream().unwrap().clone();
        f.handler.handle(&mut b, Message::new(Payload::Stop));
        let own = b.stream().unwrap().clone();
        assert_ne!(shared.uid(), own.uid());

        let reply = f
            .handler
            .handle(&mut b, Message::new(Payload::SubscribeStream(shared.uid())));
        assert_eq!(status(reply), Some(StatusKind::Ack));
        assert_eq!(shared.subscriber_count(), 2);
        assert_eq!(own.subscriber_count(), 0);

        let reply = f
            .handler
            .handle(&mut b, Message::new(Payload::SubscribeStream(4242)));
        assert_eq!(status(reply), Some(StatusKind::Nack));
        assert_eq!(b.stream().unwrap().uid(), shared.uid());
    }

    #[tokio::test]
    async fn test_range_reply() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);
        f.handler.handle_batch(&mut s, vec![gps(300), gps(100)]);

        let reply = f
            .handler
            .handle(&mut s, Message::new(Payload::PlaybackTimeRange { min: 0, max: 0 }))
            .unwrap();
        assert!(matches!(
            reply.payload,
            Payload::PlaybackTimeRange { min: 100, max: 300 }
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);
        let reply = f.handler.handle_batch(
            &mut s,
            vec![Message::new(Payload::Unknown {
                tag: 999,
                body: vec![1, 2, 3],
            })],
        );
        assert!(reply.is_empty());
        assert_eq!(f.store.count().unwrap(), 0);
        assert!(s.stream().is_none());
    }

    struct RejectingStore;

    impl EventStore for RejectingStore {
        fn get_events(
            &self,
            _ts: i64,
            _direction: Direction,
            _max: usize,
        ) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }

        fn event_range(&self) -> Result<Option<(i64, i64)>, StoreError> {
            Ok(None)
        }

        fn append(&self, msg: &Message) -> Result<(), StoreError> {
            Err(StoreError::NotData(msg.message_type()))
        }

        fn count(&self) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_rejection_nacks_but_broadcasts() {
        let registry = Registry::new(
            Arc::new(RejectingStore),
            ReplayConfig::default(),
            Handle::current(),
        );
        let handler = MessageHandler::new(registry, false);
        let (mut watcher, mut rx) = session(1);
        let (mut feeder, _feeder_rx) = session(2);
        handler.handle(&mut watcher, Message::new(Payload::Start));

        let replies = handler.handle_batch(&mut feeder, vec![gps(1), gps(2)]);
        assert_eq!(replies.len(), 1);
        assert_eq!(status(replies.into_iter().next()), Some(StatusKind::Nack));
        assert_eq!(rx.recv().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_stream() {
        let f = fixture(false);
        let (mut s, _rx) = session(1);
        f.handler.handle(&mut s, Message::new(Payload::Start));
        let stream = s.stream().unwrap().clone();
        assert_eq!(f.handler.registry().live_count(), 1);

        f.handler.disconnect(&mut s);
        assert_eq!(stream.subscriber_count(), 0);
        assert_eq!(f.handler.registry().live_count(), 0);
        assert!(s.stream().is_none());
    }

    #[tokio::test]
    async fn test_private_streams_do_not_accumulate() {
        let f = fixture(false);
        for id in 0..1000 {
            let (mut s, _rx) = session(id);
            f.handler.handle(&mut s, Message::new(Payload::Start));
            f.handler.disconnect(&mut s);
        }
        assert_eq!(f.handler.registry().stream_count(), 0);
    }

    #[tokio::test]
    async fn test_described_or_shared_streams_survive_disconnect() {
        let f = fixture(false);
        let (mut a, _rx_a) = session(1);
        f.handler.handle(
            &mut a,
            Message::new(Payload::StreamDescription("night shift".into())),
        );
        f.handler.disconnect(&mut a);

        let (mut b, _rx_b) = session(2);
        let (mut c, _rx_c) = session(3);
        f.handler.handle(&mut b, Message::new(Payload::Start));
        let shared = b.stream().unwrap().uid();
        f.handler
            .handle(&mut c, Message::new(Payload::SubscribeStream(shared)));
        f.handler.disconnect(&mut c);
        f.handler.disconnect(&mut b);

        assert_eq!(f.handler.registry().stream_count(), 2);
    }

    #[tokio::test]
    async fn test_switching_away_drops_private_stream() {
        let f = fixture(false);
        let (mut a, _rx_a) = session(1);
        let (mut b, _rx_b) = session(2);
        f.handler.handle(&mut a, Message::new(Payload::Start));
        let target = a.stream().unwrap().uid();
        f.handler.handle(&mut b, Message::new(Payload::Start));
        assert_eq!(f.handler.registry().stream_count(), 2);

        f.handler
            .handle(&mut b, Message::new(Payload::SubscribeStream(target)));
        assert_eq!(f.handler.registry().stream_count(), 1);
        assert!(f.handler.registry().get_stream(target).is_some());
    }
}
