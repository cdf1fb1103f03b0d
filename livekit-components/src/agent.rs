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
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    id::ParticipantIdentity,
    observable::{Observable, ObservableError},
    room::{ConnectionState, ParticipantInfo, ParticipantKind, RoomEvent, TrackSource, Transport},
};

pub const AGENT_STATE_ATTRIBUTE: &str = "lk.agent.state";
pub const PUBLISH_ON_BEHALF_ATTRIBUTE: &str = "lk.publish_on_behalf";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AgentState {
    #[default]
    Disconnected,
    Connecting,
    Initializing,
    Idle,
    Listening,
    Thinking,
    Speaking,
    Failed,
    Unknown,
}

impl AgentState {
    /// Parses the value of the `lk.agent.state` attribute.
    pub fn from_attribute(value: &str) -> Self {
        match value {
            "initializing" => Self::Initializing,
            "idle" => Self::Idle,
            "listening" => Self::Listening,
            "thinking" => Self::Thinking,
            "speaking" => Self::Speaking,
            _ => Self::Unknown,
        }
    }

    /// Whether the agent is ready to converse.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle | Self::Listening | Self::Thinking | Self::Speaking)
    }
}

/// The agent participant and the worker publishing on its behalf, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentIdentities {
    pub agent: Option<ParticipantIdentity>,
    pub worker: Option<ParticipantIdentity>,
}

impl AgentIdentities {
    /// Finds the agent among `participants`. Participants publishing on
    /// behalf of another one are workers, never the agent itself.
    pub fn resolve(participants: &HashMap<ParticipantIdentity, ParticipantInfo>) -> Self {
        let agent = participants
            .values()
            .filter(|p| p.kind == ParticipantKind::Agent)
            .filter(|p| !p.attributes.contains_key(PUBLISH_ON_BEHALF_ATTRIBUTE))
            .map(|p| &p.identity)
            .min_by(|a, b| a.as_str().cmp(b.as_str()))
            .cloned();
        let worker = agent.as_ref().and_then(|agent| {
            participants
                .values()
                .filter(|p| {
                    p.attributes
                        .get(PUBLISH_ON_BEHALF_ATTRIBUTE)
                        .is_some_and(|on_behalf| on_behalf == agent.as_str())
                })
                .map(|p| &p.identity)
                .min_by(|a, b| a.as_str().cmp(b.as_str()))
                .cloned()
        });
        Self { agent, worker }
    }

    pub fn contains(&self, identity: &ParticipantIdentity) -> bool {
        self.agent.as_ref() == Some(identity) || self.worker.as_ref() == Some(identity)
    }
}

/// Everything the agent state is derived from.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentStateInputs<'a> {
    pub connection_state: ConnectionState,
    pub agent_present: bool,
    pub agent_attribute: Option<&'a str>,
    pub microphone_active: bool,
    pub failed: bool,
}

/// Derives the agent state. A recorded failure wins over everything else,
/// then the connection state. An active local microphone forces `Listening`
/// only once connected with an agent present; before that the agent is
/// still `Connecting` or `Initializing` whatever the microphone does.
pub fn derive_agent_state(inputs: AgentStateInputs<'_>) -> AgentState {
    if inputs.failed {
        return AgentState::Failed;
    }
    match inputs.connection_state {
        ConnectionState::Disconnected => return AgentState::Disconnected,
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            return AgentState::Connecting
        }
        ConnectionState::Connected => {}
    }
    if !inputs.agent_present {
        return AgentState::Initializing;
    }
    if inputs.microphone_active {
        return AgentState::Listening;
    }
    inputs.agent_attribute.map_or(AgentState::Initializing, AgentState::from_attribute)
}

/// Whether speech captured now has to be buffered until the agent is
/// ready.
pub fn is_buffering_speech(
    state: AgentState,
    connection_state: ConnectionState,
    microphone_active: bool,
) -> bool {
    connection_state == ConnectionState::Connected && !state.is_available() && !microphone_active
}

#[derive(Default)]
struct Tracker {
    connection_state: ConnectionState,
    participants: HashMap<ParticipantIdentity, ParticipantInfo>,
    microphone_active: bool,
    failure: Option<String>,
}

struct AgentInner {
    tracker: Mutex<Tracker>,
    state: Observable<AgentState>,
    identities: Observable<AgentIdentities>,
    remote_participants: Observable<Arc<HashSet<ParticipantIdentity>>>,
    buffering: Observable<bool>,
}

impl AgentInner {
    fn handle_event(&self, event: RoomEvent) {
        let mut tracker = self.tracker.lock();
        match event {
            RoomEvent::ParticipantConnected(info) => {
                tracker.participants.insert(info.identity.clone(), info);
            }
            RoomEvent::ParticipantDisconnected(info) => {
                tracker.participants.remove(&info.identity);
            }
            RoomEvent::ParticipantAttributesChanged {
                participant_identity,
                changed_attributes,
            } => {
                let Some(participant) = tracker.participants.get_mut(&participant_identity)
                else {
                    return;
                };
                for (key, value) in changed_attributes {
                    if value.is_empty() {
                        participant.attributes.remove(&key);
                    } else {
                        participant.attributes.insert(key, value);
                    }
                }
            }
            RoomEvent::LocalTrackPublished(track) if track.source == Some(TrackSource::Microphone) => {
                tracker.microphone_active = true;
            }
            RoomEvent::LocalTrackUnpublished(track)
                if track.source == Some(TrackSource::Microphone) =>
            {
                tracker.microphone_active = false;
            }
            RoomEvent::ConnectionStateChanged(state) => {
                tracker.connection_state = state;
                if state == ConnectionState::Disconnected {
                    tracker.participants.clear();
                }
            }
            _ => return,
        }
        self.recompute(&tracker);
    }

    fn recompute(&self, tracker: &Tracker) {
        let identities = AgentIdentities::resolve(&tracker.participants);
        let agent_attribute = identities
            .agent
            .as_ref()
            .and_then(|agent| tracker.participants.get(agent))
            .and_then(|agent| agent.attributes.get(AGENT_STATE_ATTRIBUTE))
            .map(String::as_str);
        let state = derive_agent_state(AgentStateInputs {
            connection_state: tracker.connection_state,
            agent_present: identities.agent.is_some(),
            agent_attribute,
            microphone_active: tracker.microphone_active,
            failed: tracker.failure.is_some(),
        });

        if self.state.set_if_changed(state) {
            log::debug!("agent state changed to {:?}", state);
        }
        self.identities.set_if_changed(identities);
        self.remote_participants
            .set_if_changed(Arc::new(tracker.participants.keys().cloned().collect()));
        self.buffering.set_if_changed(is_buffering_speech(
            state,
            tracker.connection_state,
            tracker.microphone_active,
        ));
    }
}

/// Tracks the agent participant of a room and derives its conversational
/// state.
pub struct Agent<T: Transport> {
    room: Arc<T>,
    inner: Arc<AgentInner>,
    task: JoinHandle<()>,
}

impl<T: Transport> Agent<T> {
    /// Starts tracking room events. Must be called from within a tokio
    /// runtime.
    pub fn new(room: Arc<T>) -> Self {
        // Subscribe before taking the snapshot so no event falls in between.
        let events = room.subscribe();
        let tracker = Tracker {
            connection_state: room.connection_state().get(),
            participants: room.remote_participants(),
            microphone_active: room.local_track_published(TrackSource::Microphone),
            failure: None,
        };
        let inner = Arc::new(AgentInner {
            tracker: Mutex::new(Tracker::default()),
            state: Observable::default(),
            identities: Observable::default(),
            remote_participants: Observable::default(),
            buffering: Observable::default(),
        });
        inner.recompute(&tracker);
        *inner.tracker.lock() = tracker;

        let task = tokio::spawn(agent_task(events, inner.clone()));
        Self { room, inner, task }
    }

    pub fn state(&self) -> AgentState {
        self.inner.state.get()
    }

    pub fn state_observable(&self) -> &Observable<AgentState> {
        &self.inner.state
    }

    pub fn identities(&self) -> &Observable<AgentIdentities> {
        &self.inner.identities
    }

    /// Identities of the remote participants currently in the room.
    pub fn remote_participants(&self) -> &Observable<Arc<HashSet<ParticipantIdentity>>> {
        &self.inner.remote_participants
    }

    pub fn is_available(&self) -> bool {
        self.state().is_available()
    }

    pub fn is_buffering_speech(&self) -> &Observable<bool> {
        &self.inner.buffering
    }

    /// Marks the agent as failed. The state stays `Failed` until the failure
    /// is cleared.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("agent failed: {}", reason);
        let mut tracker = self.inner.tracker.lock();
        tracker.failure = Some(reason);
        self.inner.recompute(&tracker);
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.inner.tracker.lock().failure.clone()
    }

    pub(crate) fn clear_failure(&self) {
        let mut tracker = self.inner.tracker.lock();
        if tracker.failure.take().is_some() {
            self.inner.recompute(&tracker);
        }
    }

    /// Resolves once the agent is available, with the state it reached.
    pub fn wait_until_available(&self) -> impl Future<Output = Result<AgentState, ObservableError>> {
        self.inner.state.wait_until(AgentState::is_available)
    }

    pub fn wait_until_connected(
        &self,
    ) -> impl Future<Output = Result<ConnectionState, ObservableError>> {
        self.room.connection_state().wait_until(|state| *state == ConnectionState::Connected)
    }

    pub fn wait_until_disconnected(
        &self,
    ) -> impl Future<Output = Result<ConnectionState, ObservableError>> {
        self.room.connection_state().wait_until(|state| *state == ConnectionState::Disconnected)
    }
}

impl<T: Transport> Drop for Agent<T> {
    fn drop(&mut self) {
        self.task.abort();
        self.inner.state.close();
        self.inner.identities.close();
        self.inner.remote_participants.close();
        self.inner.buffering.close();
    }
}

async fn agent_task(mut events: mpsc::UnboundedReceiver<RoomEvent>, inner: Arc<AgentInner>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(agent_attribute: Option<&str>, microphone_active: bool) -> AgentStateInputs<'_> {
        AgentStateInputs {
            connection_state: ConnectionState::Connected,
            agent_present: true,
            agent_attribute,
            microphone_active,
            failed: false,
        }
    }

    #[test]
    fn test_connection_phases() {
        let mut inputs = AgentStateInputs::default();
        assert_eq!(derive_agent_state(inputs), AgentState::Disconnected);
        inputs.connection_state = ConnectionState::Connecting;
        assert_eq!(derive_agent_state(inputs), AgentState::Connecting);
        inputs.connection_state = ConnectionState::Connected;
        assert_eq!(derive_agent_state(inputs), AgentState::Initializing);
    }

    #[test]
    fn test_mirrors_attribute() {
        assert_eq!(derive_agent_state(connected(Some("thinking"), false)), AgentState::Thinking);
        assert_eq!(derive_agent_state(connected(Some("speaking"), false)), AgentState::Speaking);
        assert_eq!(derive_agent_state(connected(Some("dancing"), false)), AgentState::Unknown);
        assert_eq!(derive_agent_state(connected(None, false)), AgentState::Initializing);
    }

    #[test]
    fn test_microphone_forces_listening() {
        for attribute in ["idle", "thinking", "speaking", "initializing"] {
            assert_eq!(
                derive_agent_state(connected(Some(attribute), true)),
                AgentState::Listening
            );
        }
    }

    #[test]
    fn test_microphone_needs_agent() {
        let inputs = AgentStateInputs { agent_present: false, ..connected(None, true) };
        assert_eq!(derive_agent_state(inputs), AgentState::Initializing);

        let inputs =
            AgentStateInputs { connection_state: ConnectionState::Connecting, ..connected(None, true) };
        assert_eq!(derive_agent_state(inputs), AgentState::Connecting);
    }

    #[test]
    fn test_failure_wins() {
        let mut inputs = connected(Some("speaking"), true);
        inputs.failed = true;
        assert_eq!(derive_agent_state(inputs), AgentState::Failed);
    }

    #[test]
    fn test_buffering_speech() {
        let connected = ConnectionState::Connected;
        assert!(is_buffering_speech(AgentState::Initializing, connected, false));
        assert!(!is_buffering_speech(AgentState::Initializing, connected, true));
        assert!(!is_buffering_speech(AgentState::Idle, connected, false));
        assert!(!is_buffering_speech(AgentState::Connecting, ConnectionState::Connecting, false));
    }

    #[test]
    fn test_resolve_identities() {
        let agent = ParticipantInfo::new("agent", ParticipantKind::Agent);
        let worker = ParticipantInfo::new("worker", ParticipantKind::Agent).with_attributes(
            [(PUBLISH_ON_BEHALF_ATTRIBUTE.to_owned(), "agent".to_owned())].into(),
        );
        let user = ParticipantInfo::new("user", ParticipantKind::Standard);
        let participants: HashMap<_, _> =
            [agent, worker, user].into_iter().map(|p| (p.identity.clone(), p)).collect();

        let identities = AgentIdentities::resolve(&participants);
        assert_eq!(identities.agent, Some("agent".into()));
        assert_eq!(identities.worker, Some("worker".into()));
        assert!(identities.contains(&"worker".into()));
        assert!(!identities.contains(&"user".into()));
    }
}
