// Copyright 2025 LiveKit, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process transport connecting rooms through a shared [`LoopbackServer`].
//!
//! Packets are delivered synchronously and in order to every other connected
//! room, using the same header/chunk/trailer handling as a networked room.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::mpsc;

use super::{
    data_stream::{proto, IncomingStreamManager, PacketSink},
    utils::{calculate_changed_attributes, dispatcher::Dispatcher},
    ConnectionState, ParticipantInfo, RoomEvent, StreamError, StreamResult, StreamTextOptions,
    TextStreamHandler, TextStreamInfo, TextStreamWriter, TrackReference, TrackSource, Transport,
    TransportError, TransportResult,
};
use crate::{id::ParticipantIdentity, observable::Observable};

#[derive(Clone, Debug)]
pub struct LoopbackOptions {
    pub server_version: String,
    /// Delay applied before each outgoing packet is delivered.
    pub send_latency: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self { server_version: "1.9.0".to_owned(), send_latency: Duration::ZERO }
    }
}

/// Outgoing packet recorded by a [`LoopbackRoom`], in send order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    StreamHeader { stream_id: String, topic: String },
    StreamChunk { stream_id: String, chunk_index: u64 },
    StreamTrailer { stream_id: String },
    Data { topic: Option<String> },
}

#[derive(Clone, Default)]
pub struct LoopbackServer {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    options: LoopbackOptions,
    rooms: Mutex<HashMap<ParticipantIdentity, Weak<RoomInner>>>,
}

impl LoopbackServer {
    pub fn new(options: LoopbackOptions) -> Self {
        Self { inner: Arc::new(ServerInner { options, rooms: Default::default() }) }
    }

    /// Creates a disconnected room for the given participant.
    pub fn room(&self, info: ParticipantInfo) -> Arc<LoopbackRoom> {
        Arc::new(LoopbackRoom {
            inner: Arc::new(RoomInner {
                server: self.inner.clone(),
                info: Mutex::new(info),
                connection_state: Observable::new(ConnectionState::Disconnected),
                events: Dispatcher::default(),
                incoming: Mutex::new(IncomingStreamManager::default()),
                published_tracks: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                journal: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl ServerInner {
    /// Connected rooms other than `identity`.
    fn peers_of(&self, identity: &ParticipantIdentity) -> Vec<Arc<RoomInner>> {
        self.rooms
            .lock()
            .iter()
            .filter(|(peer, _)| *peer != identity)
            .filter_map(|(_, room)| room.upgrade())
            .collect()
    }
}

pub struct LoopbackRoom {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    server: Arc<ServerInner>,
    info: Mutex<ParticipantInfo>,
    connection_state: Observable<ConnectionState>,
    events: Dispatcher<RoomEvent>,
    incoming: Mutex<IncomingStreamManager>,
    published_tracks: Mutex<Vec<TrackReference>>,
    fail_sends: AtomicBool,
    journal: Mutex<Vec<JournalEntry>>,
}

impl RoomInner {
    fn identity(&self) -> ParticipantIdentity {
        self.info.lock().identity.clone()
    }

    fn is_connected(&self) -> bool {
        self.connection_state.get() == ConnectionState::Connected
    }

    fn set_connection_state(&self, state: ConnectionState) {
        if self.connection_state.set_if_changed(state) {
            self.events.dispatch(&RoomEvent::ConnectionStateChanged(state));
        }
    }

    fn targets(&self, destination_identities: &[ParticipantIdentity]) -> Vec<Arc<RoomInner>> {
        self.server
            .peers_of(&self.identity())
            .into_iter()
            .filter(|peer| {
                destination_identities.is_empty()
                    || destination_identities.contains(&peer.identity())
            })
            .collect()
    }

    async fn before_send(&self) -> bool {
        if self.fail_sends.load(Ordering::SeqCst) || !self.is_connected() {
            return false;
        }
        let latency = self.server.options.send_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        true
    }
}

impl PacketSink for RoomInner {
    fn send_packet(
        &self,
        packet: proto::Packet,
        destination_identities: &[ParticipantIdentity],
    ) -> Pin<Box<dyn Future<Output = StreamResult<()>> + Send + '_>> {
        let destination_identities = destination_identities.to_vec();
        Box::pin(async move {
            if !self.before_send().await {
                Err(StreamError::SendFailed)?
            }
            self.journal.lock().push(match &packet {
                proto::Packet::StreamHeader(header) => JournalEntry::StreamHeader {
                    stream_id: header.stream_id.clone(),
                    topic: header.topic.clone(),
                },
                proto::Packet::StreamChunk(chunk) => JournalEntry::StreamChunk {
                    stream_id: chunk.stream_id.clone(),
                    chunk_index: chunk.chunk_index,
                },
                proto::Packet::StreamTrailer(trailer) => {
                    JournalEntry::StreamTrailer { stream_id: trailer.stream_id.clone() }
                }
            });

            let identity = self.identity();
            for target in self.targets(&destination_identities) {
                target.incoming.lock().handle_packet(packet.clone(), &identity);
            }
            Ok(())
        })
    }
}

impl LoopbackRoom {
    pub fn info(&self) -> ParticipantInfo {
        self.inner.info.lock().clone()
    }

    /// Makes every following send fail until reset.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Outgoing packets recorded so far.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner.journal.lock().clone()
    }

    /// Replaces the local participant's attributes and notifies peers of the
    /// keys that changed.
    pub fn set_attributes(&self, attributes: HashMap<String, String>) {
        let (identity, changed_attributes) = {
            let mut info = self.inner.info.lock();
            let changed = calculate_changed_attributes(&info.attributes, &attributes);
            info.attributes = attributes;
            (info.identity.clone(), changed)
        };
        if changed_attributes.is_empty() || !self.inner.is_connected() {
            return;
        }
        let event = RoomEvent::ParticipantAttributesChanged {
            participant_identity: identity,
            changed_attributes,
        };
        for peer in self.inner.server.peers_of(&self.inner.identity()) {
            peer.events.dispatch(&event);
        }
    }

    pub fn publish_track(&self, source: TrackSource) {
        let track = TrackReference::from_source(self.inner.identity(), source);
        {
            let mut tracks = self.inner.published_tracks.lock();
            if tracks.iter().any(|t| t.matches(&track)) {
                return;
            }
            tracks.push(track.clone());
        }
        self.inner.events.dispatch(&RoomEvent::LocalTrackPublished(track));
    }

    pub fn unpublish_track(&self, source: TrackSource) {
        let query = TrackReference::from_source(self.inner.identity(), source);
        let removed: Vec<TrackReference> = {
            let mut tracks = self.inner.published_tracks.lock();
            let (removed, kept) = tracks.drain(..).partition(|t| query.matches(t));
            *tracks = kept;
            removed
        };
        for track in removed {
            self.inner.events.dispatch(&RoomEvent::LocalTrackUnpublished(track));
        }
    }
}

impl Transport for LoopbackRoom {
    fn local_identity(&self) -> ParticipantIdentity {
        self.inner.identity()
    }

    fn connection_state(&self) -> &Observable<ConnectionState> {
        &self.inner.connection_state
    }

    fn server_version(&self) -> Option<String> {
        self.inner.is_connected().then(|| self.inner.server.options.server_version.clone())
    }

    fn remote_participants(&self) -> HashMap<ParticipantIdentity, ParticipantInfo> {
        if !self.inner.is_connected() {
            return HashMap::new();
        }
        self.inner
            .server
            .peers_of(&self.inner.identity())
            .into_iter()
            .map(|peer| {
                let info = peer.info.lock().clone();
                (info.identity.clone(), info)
            })
            .collect()
    }

    fn local_track_published(&self, source: TrackSource) -> bool {
        self.inner.published_tracks.lock().iter().any(|t| t.source == Some(source))
    }

    async fn connect(&self, url: &str, token: &str) -> TransportResult<()> {
        if token.is_empty() {
            Err(TransportError::InvalidToken("empty token".to_owned()))?
        }
        log::debug!("connecting {} to {}", self.inner.identity(), url);
        self.inner.set_connection_state(ConnectionState::Connecting);
        tokio::task::yield_now().await;

        let identity = self.inner.identity();
        let local_info = self.inner.info.lock().clone();
        let peers = {
            let mut rooms = self.inner.server.rooms.lock();
            rooms.insert(identity.clone(), Arc::downgrade(&self.inner));
            rooms
                .iter()
                .filter(|(peer, _)| **peer != identity)
                .filter_map(|(_, room)| room.upgrade())
                .collect::<Vec<_>>()
        };

        self.inner.set_connection_state(ConnectionState::Connected);
        for peer in peers {
            let peer_info = peer.info.lock().clone();
            self.inner.events.dispatch(&RoomEvent::ParticipantConnected(peer_info));
            peer.events.dispatch(&RoomEvent::ParticipantConnected(local_info.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let identity = self.inner.identity();
        let was_registered = self.inner.server.rooms.lock().remove(&identity).is_some();
        if was_registered {
            let local_info = self.inner.info.lock().clone();
            for peer in self.inner.server.peers_of(&identity) {
                peer.incoming.lock().terminate_streams_from(&identity);
                peer.events.dispatch(&RoomEvent::ParticipantDisconnected(local_info.clone()));
            }
        }
        self.inner.set_connection_state(ConnectionState::Disconnected);
    }

    async fn send_text(&self, text: &str, options: StreamTextOptions) -> StreamResult<TextStreamInfo> {
        let sink: Arc<dyn PacketSink> = self.inner.clone();
        TextStreamWriter::send_text(sink, text, options).await
    }

    async fn stream_text(&self, options: StreamTextOptions) -> StreamResult<TextStreamWriter> {
        let sink: Arc<dyn PacketSink> = self.inner.clone();
        TextStreamWriter::open(sink, options, None).await
    }

    async fn publish_data(
        &self,
        payload: Vec<u8>,
        topic: Option<String>,
        _reliable: bool,
    ) -> TransportResult<()> {
        if !self.inner.is_connected() {
            Err(TransportError::NotConnected)?
        }
        if !self.inner.before_send().await {
            Err(TransportError::SendFailed)?
        }
        self.inner.journal.lock().push(JournalEntry::Data { topic: topic.clone() });

        let event = RoomEvent::DataReceived {
            payload: Arc::new(payload),
            topic,
            participant_identity: self.inner.identity(),
        };
        for target in self.inner.targets(&[]) {
            target.events.dispatch(&event);
        }
        Ok(())
    }

    fn register_text_stream_handler(
        &self,
        topic: &str,
        handler: TextStreamHandler,
    ) -> StreamResult<()> {
        self.inner.incoming.lock().handlers.register_text_stream_handler(topic, handler)
    }

    fn unregister_text_stream_handler(&self, topic: &str) {
        self.inner.incoming.lock().handlers.unregister_text_stream_handler(topic)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomEvent> {
        self.inner.events.register()
    }
}

impl Drop for LoopbackRoom {
    fn drop(&mut self) {
        let identity = self.inner.identity();
        let mut rooms = self.inner.server.rooms.lock();
        if rooms.get(&identity).is_some_and(|room| room.ptr_eq(&Arc::downgrade(&self.inner))) {
            rooms.remove(&identity);
        }
        drop(rooms);
        self.inner.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{ParticipantKind, StreamReader, StreamWriter};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_pair() -> (Arc<LoopbackRoom>, Arc<LoopbackRoom>) {
        let server = LoopbackServer::default();
        let a = server.room(ParticipantInfo::new("a", ParticipantKind::Standard));
        let b = server.room(ParticipantInfo::new("b", ParticipantKind::Standard));
        a.connect("loopback://", "token-a").await.unwrap();
        b.connect("loopback://", "token-b").await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_connect_announces_participants() {
        let server = LoopbackServer::default();
        let a = server.room(ParticipantInfo::new("a", ParticipantKind::Standard));
        let b = server.room(ParticipantInfo::new("b", ParticipantKind::Agent));
        let mut a_events = a.subscribe();

        a.connect("loopback://", "token").await.unwrap();
        b.connect("loopback://", "token").await.unwrap();

        let mut connected = None;
        while let Some(event) = a_events.recv().await {
            if let RoomEvent::ParticipantConnected(info) = event {
                connected = Some(info);
                break;
            }
        }
        assert_eq!(connected.unwrap().identity, ParticipantIdentity::from("b"));
        assert_eq!(a.remote_participants().len(), 1);
        assert_eq!(a.server_version().as_deref(), Some("1.9.0"));

        b.disconnect().await;
        assert!(a.remote_participants().is_empty());
        assert_eq!(b.connection_state().get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let server = LoopbackServer::default();
        let a = server.room(ParticipantInfo::new("a", ParticipantKind::Standard));
        assert!(matches!(a.connect("loopback://", "").await, Err(TransportError::InvalidToken(_))));
        assert_eq!(a.connection_state().get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_text() {
        let (a, b) = connected_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_text_stream_handler(
            "topic",
            Arc::new(move |reader, identity| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Ok(text) = reader.read_all().await {
                        let _ = tx.send((identity, text));
                    }
                    Ok(())
                })
            }),
        )
        .unwrap();

        let options = StreamTextOptions { topic: "topic".into(), ..Default::default() };
        let info = a.send_text("some-text", options).await.unwrap();
        assert_eq!(info.total_length, Some(9));

        let (identity, text) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(identity, ParticipantIdentity::from("a"));
        assert_eq!(text, "some-text");
        assert_eq!(a.journal().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_writer_closes_on_drop() {
        let (a, b) = connected_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_text_stream_handler(
            "topic",
            Arc::new(move |reader, _| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Ok(text) = reader.read_all().await {
                        let _ = tx.send(text);
                    }
                    Ok(())
                })
            }),
        )
        .unwrap();

        let writer = a
            .stream_text(StreamTextOptions { topic: "topic".into(), ..Default::default() })
            .await
            .unwrap();
        writer.write("partial").await.unwrap();
        drop(writer);

        let text = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(text, "partial");
    }

    #[tokio::test]
    async fn test_fail_sends() {
        let (a, _b) = connected_pair().await;
        a.set_fail_sends(true);
        let options = StreamTextOptions { topic: "topic".into(), ..Default::default() };
        assert!(matches!(a.send_text("x", options).await, Err(StreamError::SendFailed)));
        assert!(matches!(
            a.publish_data(b"x".to_vec(), None, true).await,
            Err(TransportError::SendFailed)
        ));
        assert!(a.journal().is_empty());
    }

    #[tokio::test]
    async fn test_attributes_changed() {
        let (a, b) = connected_pair().await;
        let mut b_events = b.subscribe();
        a.set_attributes(HashMap::from([("lk.agent.state".to_owned(), "idle".to_owned())]));

        let event = timeout(Duration::from_secs(1), b_events.recv()).await.unwrap().unwrap();
        let RoomEvent::ParticipantAttributesChanged { participant_identity, changed_attributes } =
            event
        else {
            panic!("unexpected event {:?}", event);
        };
        assert_eq!(participant_identity, ParticipantIdentity::from("a"));
        assert_eq!(changed_attributes["lk.agent.state"], "idle");
        assert_eq!(b.remote_participants()[&"a".into()].attributes["lk.agent.state"], "idle");
    }

    #[tokio::test]
    async fn test_publish_track() {
        let (a, _b) = connected_pair().await;
        let mut events = a.subscribe();
        a.publish_track(TrackSource::Microphone);
        assert!(a.local_track_published(TrackSource::Microphone));
        assert!(matches!(events.recv().await, Some(RoomEvent::LocalTrackPublished(_))));

        a.unpublish_track(TrackSource::Microphone);
        assert!(!a.local_track_published(TrackSource::Microphone));
        assert!(matches!(events.recv().await, Some(RoomEvent::LocalTrackUnpublished(_))));
    }
}
