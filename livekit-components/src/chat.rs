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

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};

use crate::{
    id::ParticipantIdentity,
    observable::Observable,
    room::{
        OperationType, RoomEvent, StreamError, StreamReader, StreamTextOptions, TextStreamInfo,
        Transport,
    },
};

pub const CHAT_TOPIC: &str = "lk.chat";
pub const LEGACY_CHAT_TOPIC: &str = "lk-chat-topic";

/// First server version that relays chat over data streams to every
/// client. Legacy copies sent to such servers are flagged as ignorable.
const DATA_STREAM_CHAT_VERSION: semver::Version = semver::Version::new(1, 8, 2);

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to send chat message: {0}")]
    Stream(#[from] StreamError),
    #[error("only messages sent by the local participant can be edited")]
    NotOwnMessage,
}

/// Per-message options.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub attributes: HashMap<String, String>,
    /// Recipients of the message, everyone when empty.
    pub destination_identities: Vec<ParticipantIdentity>,
}

#[derive(Clone, Debug)]
pub struct ChatOptions {
    pub topic: String,
    pub legacy_topic: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self { topic: CHAT_TOPIC.to_owned(), legacy_topic: LEGACY_CHAT_TOPIC.to_owned() }
    }
}

/// A chat message as kept in the local log. Timestamps are milliseconds
/// since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub timestamp: i64,
    pub message: String,
    pub edit_timestamp: Option<i64>,
    pub sender: Option<ParticipantIdentity>,
    pub attributes: HashMap<String, String>,
}

/// Payload published on the legacy chat topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyChatMessage {
    pub id: String,
    pub timestamp: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_timestamp: Option<i64>,
    #[serde(default)]
    pub ignore_legacy: bool,
}

impl LegacyChatMessage {
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Message log shared with the receive paths.
#[derive(Default)]
struct ChatLog {
    state: Mutex<Vec<ChatMessage>>,
    messages: Observable<Arc<Vec<ChatMessage>>>,
}

impl ChatLog {
    /// Appends `message`, or replaces the entry with the same id and sender.
    /// A replacement keeps the original timestamp and records the time of
    /// the new content as its edit timestamp.
    fn add_message(&self, message: ChatMessage) {
        let mut state = self.state.lock();
        let existing =
            state.iter().position(|m| m.id == message.id && m.sender == message.sender);
        match existing {
            Some(index) => {
                let edited_at = message.edit_timestamp.unwrap_or(message.timestamp);
                let timestamp = state[index].timestamp;
                state[index] =
                    ChatMessage { timestamp, edit_timestamp: Some(edited_at), ..message };
            }
            None => state.push(message),
        }
        self.messages.set(Arc::new(state.clone()));
    }
}

/// Chat over a room.
///
/// Each send goes out twice: first as a text stream on the chat topic, then
/// as a legacy JSON packet on the legacy topic for clients that predate data
/// streams. Sends are serialized; the log is updated independently so
/// incoming messages are never blocked by an outgoing one.
pub struct Chat<T: Transport> {
    room: Arc<T>,
    options: ChatOptions,
    send_lock: AsyncMutex<()>,
    log: Arc<ChatLog>,
    is_sending: Observable<bool>,
    legacy_task: JoinHandle<()>,
}

impl<T: Transport> Chat<T> {
    /// Registers the chat topic handler and starts listening for legacy
    /// packets. Must be called from within a tokio runtime.
    pub fn new(room: Arc<T>, options: ChatOptions) -> ChatResult<Self> {
        let log = Arc::new(ChatLog::default());

        let handler_log = log.clone();
        room.register_text_stream_handler(
            &options.topic,
            Arc::new(move |reader, identity| {
                let log = handler_log.clone();
                Box::pin(async move {
                    let info = reader.info().clone();
                    match reader.read_all().await {
                        Ok(text) => {
                            log.add_message(chat_message_from_stream(&info, identity, text))
                        }
                        Err(e) => log::warn!("incomplete chat message {}: {}", info.id, e),
                    }
                    Ok(())
                })
            }),
        )?;

        let legacy_task = tokio::spawn(legacy_chat_task(
            room.subscribe(),
            log.clone(),
            options.legacy_topic.clone(),
        ));

        Ok(Self {
            room,
            options,
            send_lock: AsyncMutex::new(()),
            log,
            is_sending: Observable::new(false),
            legacy_task,
        })
    }

    /// Sends a new message and appends it to the local log.
    ///
    /// Concurrent calls are sent one after the other, in call order.
    pub async fn send(&self, message: &str) -> ChatResult<ChatMessage> {
        self.send_with_options(message, SendOptions::default()).await
    }

    pub async fn send_with_options(
        &self,
        message: &str,
        options: SendOptions,
    ) -> ChatResult<ChatMessage> {
        let _guard = self.send_lock.lock().await;
        let _sending = SendingGuard::new(&self.is_sending);
        self.publish(message, None, options).await
    }

    /// Replaces the content of a message previously sent by the local
    /// participant.
    pub async fn edit(&self, original: &ChatMessage, message: &str) -> ChatResult<ChatMessage> {
        if original.sender.as_ref() != Some(&self.room.local_identity()) {
            return Err(ChatError::NotOwnMessage);
        }
        let _guard = self.send_lock.lock().await;
        let _sending = SendingGuard::new(&self.is_sending);
        let options = SendOptions { attributes: original.attributes.clone(), ..Default::default() };
        self.publish(message, Some(original), options).await
    }

    async fn publish(
        &self,
        text: &str,
        original: Option<&ChatMessage>,
        options: SendOptions,
    ) -> ChatResult<ChatMessage> {
        let options = StreamTextOptions {
            topic: self.options.topic.clone(),
            attributes: options.attributes,
            destination_identities: options.destination_identities,
            id: original.map(|m| m.id.clone()),
            operation_type: original.map(|_| OperationType::Update),
            ..Default::default()
        };
        // Nothing is committed when the primary send fails.
        let info = self.room.send_text(text, options).await?;
        let sent_at = info.timestamp.timestamp_millis();

        let message = match original {
            Some(original) => ChatMessage {
                message: text.to_owned(),
                edit_timestamp: Some(sent_at),
                ..original.clone()
            },
            None => ChatMessage {
                id: info.id,
                timestamp: sent_at,
                message: text.to_owned(),
                edit_timestamp: None,
                sender: Some(self.room.local_identity()),
                attributes: info.attributes,
            },
        };

        let legacy = LegacyChatMessage {
            id: message.id.clone(),
            timestamp: message.timestamp,
            message: message.message.clone(),
            edit_timestamp: message.edit_timestamp,
            ignore_legacy: self.server_relays_data_streams(),
        };
        self.publish_legacy(&legacy).await;

        self.log.add_message(message.clone());
        Ok(message)
    }

    /// Best effort: the message is already delivered to current clients.
    async fn publish_legacy(&self, legacy: &LegacyChatMessage) {
        let payload = match legacy.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode legacy chat message {}: {}", legacy.id, e);
                return;
            }
        };
        let topic = Some(self.options.legacy_topic.clone());
        if let Err(e) = self.room.publish_data(payload, topic, true).await {
            log::warn!("failed to publish legacy chat message {}: {}", legacy.id, e);
        }
    }

    /// Inserts a message into the log as if it had been received.
    pub fn add_message(&self, message: ChatMessage) {
        self.log.add_message(message);
    }

    pub fn messages(&self) -> &Observable<Arc<Vec<ChatMessage>>> {
        &self.log.messages
    }

    pub fn snapshot(&self) -> Arc<Vec<ChatMessage>> {
        self.log.messages.get()
    }

    pub fn is_sending(&self) -> &Observable<bool> {
        &self.is_sending
    }

    fn server_relays_data_streams(&self) -> bool {
        self.room.server_version().is_some_and(|version| relays_data_streams(&version))
    }
}

impl<T: Transport> Drop for Chat<T> {
    fn drop(&mut self) {
        self.room.unregister_text_stream_handler(&self.options.topic);
        self.legacy_task.abort();
        self.log.messages.close();
    }
}

fn chat_message_from_stream(
    info: &TextStreamInfo,
    sender: ParticipantIdentity,
    text: String,
) -> ChatMessage {
    let timestamp = info.timestamp.timestamp_millis();
    ChatMessage {
        id: info.id.clone(),
        timestamp,
        message: text,
        edit_timestamp: (info.operation_type == OperationType::Update).then_some(timestamp),
        sender: Some(sender),
        attributes: info.attributes.clone(),
    }
}

async fn legacy_chat_task(
    mut events: tokio::sync::mpsc::UnboundedReceiver<RoomEvent>,
    log: Arc<ChatLog>,
    legacy_topic: String,
) {
    while let Some(event) = events.recv().await {
        let RoomEvent::DataReceived { payload, topic, participant_identity } = event else {
            continue;
        };
        if topic.as_deref() != Some(legacy_topic.as_str()) {
            continue;
        }
        let legacy = match LegacyChatMessage::decode(&payload) {
            Ok(legacy) => legacy,
            Err(e) => {
                log::error!(
                    "dropping malformed legacy chat message from {}: {}",
                    participant_identity,
                    e
                );
                continue;
            }
        };
        if legacy.ignore_legacy {
            continue;
        }
        log.add_message(ChatMessage {
            id: legacy.id,
            timestamp: legacy.timestamp,
            message: legacy.message,
            edit_timestamp: legacy.edit_timestamp,
            sender: Some(participant_identity),
            attributes: HashMap::new(),
        });
    }
}

/// Holds `is_sending` high while a send is in flight, including when the
/// send future is dropped before completing.
struct SendingGuard<'a>(&'a Observable<bool>);

impl<'a> SendingGuard<'a> {
    fn new(is_sending: &'a Observable<bool>) -> Self {
        is_sending.set(true);
        Self(is_sending)
    }
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Whether a server of this version relays chat data streams to every
/// client. Unparsable versions are treated as old servers.
fn relays_data_streams(version: &str) -> bool {
    let version = version.trim().trim_start_matches('v');
    match semver::Version::parse(version) {
        Ok(version) => version >= DATA_STREAM_CHAT_VERSION,
        Err(e) => {
            log::debug!("unparsable server version {:?}: {}", version, e);
            false
        }
    }
}
