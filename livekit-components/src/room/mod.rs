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

use std::{collections::HashMap, future::Future, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{id::ParticipantIdentity, observable::Observable};

pub mod data_stream;
pub mod loopback;
pub mod track;
pub(crate) mod utils;

pub use data_stream::{
    OperationType, StreamError, StreamProgress, StreamReader, StreamResult, StreamTextOptions,
    StreamWriter, TextStreamHandler, TextStreamInfo, TextStreamReader, TextStreamWriter,
};
pub use track::{TrackReference, TrackSource};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to a room")]
    NotConnected,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("failed to send data")]
    SendFailed,
    #[error("data stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub enum ParticipantKind {
    #[default]
    Standard,
    Ingress,
    Egress,
    Sip,
    Agent,
}

/// Snapshot of a participant as known by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub identity: ParticipantIdentity,
    pub name: String,
    pub kind: ParticipantKind,
    pub attributes: HashMap<String, String>,
}

impl ParticipantInfo {
    pub fn new(identity: impl Into<ParticipantIdentity>, kind: ParticipantKind) -> Self {
        Self { identity: identity.into(), kind, ..Default::default() }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    ParticipantConnected(ParticipantInfo),
    ParticipantDisconnected(ParticipantInfo),
    /// Removed attributes are reported with an empty value.
    ParticipantAttributesChanged {
        participant_identity: ParticipantIdentity,
        changed_attributes: HashMap<String, String>,
    },
    DataReceived {
        payload: Arc<Vec<u8>>,
        topic: Option<String>,
        participant_identity: ParticipantIdentity,
    },
    LocalTrackPublished(TrackReference),
    LocalTrackUnpublished(TrackReference),
    ConnectionStateChanged(ConnectionState),
}

/// Room-scoped operations consumed by the components.
///
/// The media engine, signaling and reconnection logic live behind this trait;
/// the components only observe participants and exchange text and data
/// packets through it.
pub trait Transport: Send + Sync + 'static {
    fn local_identity(&self) -> ParticipantIdentity;

    fn connection_state(&self) -> &Observable<ConnectionState>;

    /// Version reported by the server once connected.
    fn server_version(&self) -> Option<String>;

    fn remote_participants(&self) -> HashMap<ParticipantIdentity, ParticipantInfo>;

    fn local_track_published(&self, source: TrackSource) -> bool;

    fn connect(&self, url: &str, token: &str)
        -> impl Future<Output = TransportResult<()>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Sends a complete text payload as a single data stream.
    fn send_text(
        &self,
        text: &str,
        options: StreamTextOptions,
    ) -> impl Future<Output = StreamResult<TextStreamInfo>> + Send;

    /// Opens a text stream the caller writes to incrementally.
    fn stream_text(
        &self,
        options: StreamTextOptions,
    ) -> impl Future<Output = StreamResult<TextStreamWriter>> + Send;

    /// Publishes a raw payload on the data channel.
    fn publish_data(
        &self,
        payload: Vec<u8>,
        topic: Option<String>,
        reliable: bool,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    fn register_text_stream_handler(
        &self,
        topic: &str,
        handler: TextStreamHandler,
    ) -> StreamResult<()>;

    fn unregister_text_stream_handler(&self, topic: &str);

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomEvent>;
}
