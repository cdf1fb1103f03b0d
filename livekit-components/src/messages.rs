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

use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    agent::AgentIdentities,
    chat::ChatMessage,
    id::ParticipantIdentity,
    observable::Observable,
    text_stream::TextStreamData,
    transcriptions::segment_id,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedMessageKind {
    Chat { edit_timestamp: Option<i64> },
    UserTranscription,
    AgentTranscription,
}

/// A chat message or transcription as shown in a conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    /// Origin timestamp in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub text: String,
    pub sender: Option<ParticipantIdentity>,
    pub attributes: HashMap<String, String>,
    pub kind: ReceivedMessageKind,
}

impl From<&ChatMessage> for ReceivedMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.clone(),
            timestamp: message.timestamp,
            text: message.message.clone(),
            sender: message.sender.clone(),
            attributes: message.attributes.clone(),
            kind: ReceivedMessageKind::Chat { edit_timestamp: message.edit_timestamp },
        }
    }
}

/// Classifies a transcription by the participant that sent it.
///
/// Transcriptions of the local participant's speech are user
/// transcriptions; everything else is an agent transcription. The sender is
/// kept only while it is still a known remote participant, so a transcription
/// from a participant that already left has no sender.
pub fn classify_transcription(
    data: &TextStreamData,
    local_identity: &ParticipantIdentity,
    agent: &AgentIdentities,
    remote_participants: &HashSet<ParticipantIdentity>,
) -> ReceivedMessage {
    let identity = &data.participant_identity;
    let (kind, sender) = if identity == local_identity {
        (ReceivedMessageKind::UserTranscription, Some(local_identity.clone()))
    } else if agent.contains(identity) || remote_participants.contains(identity) {
        (ReceivedMessageKind::AgentTranscription, Some(identity.clone()))
    } else {
        log::debug!("transcription {} from unknown participant {}", data.stream_info.id, identity);
        (ReceivedMessageKind::AgentTranscription, None)
    };
    ReceivedMessage {
        id: data.stream_info.id.clone(),
        timestamp: data.stream_info.timestamp.timestamp_millis(),
        text: data.text.clone(),
        sender,
        attributes: data.stream_info.attributes.clone(),
        kind,
    }
}

/// Remembers when each message id was first seen.
///
/// The order of a message is fixed the first time it is observed and never
/// recomputed, so edits and growing transcriptions keep their place.
#[derive(Debug, Default)]
pub struct MessageOrder {
    first_seen: HashMap<String, (DateTime<Utc>, u64)>,
    next_sequence: u64,
}

impl MessageOrder {
    pub fn key(&mut self, id: &str, now: DateTime<Utc>) -> (DateTime<Utc>, u64) {
        if let Some(key) = self.first_seen.get(id) {
            return *key;
        }
        let key = (now, self.next_sequence);
        self.next_sequence += 1;
        self.first_seen.insert(id.to_owned(), key);
        key
    }

    /// Merges chat messages and transcriptions into one list sorted by first
    /// observation.
    pub fn reconcile(
        &mut self,
        now: DateTime<Utc>,
        chat: &[ChatMessage],
        transcriptions: &[TextStreamData],
        local_identity: &ParticipantIdentity,
        agent: &AgentIdentities,
        remote_participants: &HashSet<ParticipantIdentity>,
    ) -> Vec<ReceivedMessage> {
        let chat = chat.iter().map(|m| (m.id.as_str(), ReceivedMessage::from(m)));
        // A segment resumed under a new stream keeps the place of its first stream.
        let transcriptions = transcriptions.iter().map(|t| {
            let order_id = segment_id(t).unwrap_or(t.stream_info.id.as_str());
            (order_id, classify_transcription(t, local_identity, agent, remote_participants))
        });
        let mut keyed = chat
            .chain(transcriptions)
            .map(|(order_id, message)| (self.key(order_id, now), message))
            .collect::<Vec<_>>();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, message)| message).collect()
    }
}

/// Conversation view of a session: chat and transcriptions merged into one
/// ordered list, recomputed whenever a source or the set of participants
/// changes.
pub struct SessionMessages {
    messages: Arc<Observable<Arc<Vec<ReceivedMessage>>>>,
    task: JoinHandle<()>,
}

impl SessionMessages {
    /// Must be called from within a tokio runtime.
    pub fn new(
        local_identity: ParticipantIdentity,
        chat: watch::Receiver<Arc<Vec<ChatMessage>>>,
        transcriptions: watch::Receiver<Arc<Vec<TextStreamData>>>,
        agent: watch::Receiver<AgentIdentities>,
        remote_participants: watch::Receiver<Arc<HashSet<ParticipantIdentity>>>,
    ) -> Self {
        let messages = Arc::new(Observable::new(Arc::new(Vec::new())));
        let task = tokio::spawn(reconcile_task(
            local_identity,
            Sources { chat, transcriptions, agent, remote_participants },
            messages.clone(),
        ));
        Self { messages, task }
    }

    pub fn messages(&self) -> &Observable<Arc<Vec<ReceivedMessage>>> {
        &self.messages
    }

    pub fn snapshot(&self) -> Arc<Vec<ReceivedMessage>> {
        self.messages.get()
    }
}

impl Drop for SessionMessages {
    fn drop(&mut self) {
        self.task.abort();
        self.messages.close();
    }
}

struct Sources {
    chat: watch::Receiver<Arc<Vec<ChatMessage>>>,
    transcriptions: watch::Receiver<Arc<Vec<TextStreamData>>>,
    agent: watch::Receiver<AgentIdentities>,
    remote_participants: watch::Receiver<Arc<HashSet<ParticipantIdentity>>>,
}

async fn reconcile_task(
    local_identity: ParticipantIdentity,
    mut sources: Sources,
    messages: Arc<Observable<Arc<Vec<ReceivedMessage>>>>,
) {
    let mut order = MessageOrder::default();
    loop {
        let reconciled = {
            let chat = sources.chat.borrow_and_update().clone();
            let transcriptions = sources.transcriptions.borrow_and_update().clone();
            let agent = sources.agent.borrow_and_update().clone();
            let remote = sources.remote_participants.borrow_and_update().clone();
            order.reconcile(Utc::now(), &chat, &transcriptions, &local_identity, &agent, &remote)
        };
        messages.set_if_changed(Arc::new(reconciled));

        let changed = tokio::select! {
            r = sources.chat.changed() => r,
            r = sources.transcriptions.changed() => r,
            r = sources.agent.changed() => r,
            r = sources.remote_participants.changed() => r,
        };
        if changed.is_err() {
            log::debug!("message sources closed, stopping reconciliation");
            break;
        }
    }
}
