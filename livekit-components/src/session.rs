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
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    agent::{Agent, AgentState},
    chat::{Chat, ChatError, ChatMessage, ChatOptions, ChatResult},
    messages::SessionMessages,
    observable::ObservableError,
    room::{StreamError, Transport, TransportError},
    text_stream::TextStreamReceiver,
    token_source::{TokenSource, TokenSourceError, TokenSourceResponse},
    transcriptions::{TranscriptionAggregator, TRANSCRIPTION_TOPIC},
};

pub const AGENT_DID_NOT_JOIN: &str = "agent did not join the room";

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to fetch token: {0}")]
    TokenSource(#[from] TokenSourceError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to register stream handler: {0}")]
    Stream(#[from] StreamError),
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
    #[error("session closed")]
    Closed(#[from] ObservableError),
    #[error("agent failed: {0}")]
    AgentFailed(String),
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// How long the agent may take to become available after connecting.
    pub agent_connect_timeout: Duration,
    pub chat: ChatOptions,
    pub transcription_topic: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            agent_connect_timeout: Duration::from_secs(20),
            chat: ChatOptions::default(),
            transcription_topic: TRANSCRIPTION_TOPIC.to_owned(),
        }
    }
}

/// A conversation with an agent in one room.
///
/// Owns the chat, transcription and agent components and ties their
/// lifetime to the session.
pub struct Session<T: Transport, S: TokenSource> {
    room: Arc<T>,
    token_source: S,
    options: SessionOptions,
    chat: Arc<Chat<T>>,
    agent: Arc<Agent<T>>,
    transcriptions: Arc<TranscriptionAggregator>,
    messages: SessionMessages,
    agent_timeout: Mutex<Option<JoinHandle<()>>>,
    _transcription_receiver: TextStreamReceiver<T>,
}

impl<T: Transport, S: TokenSource> Session<T, S> {
    /// Must be called from within a tokio runtime.
    pub fn new(room: Arc<T>, token_source: S, options: SessionOptions) -> SessionResult<Self> {
        let chat = Arc::new(Chat::new(room.clone(), options.chat.clone())?);
        let agent = Arc::new(Agent::new(room.clone()));

        let transcription_receiver =
            TextStreamReceiver::register(room.clone(), options.transcription_topic.clone())?;
        let transcriptions = Arc::new(TranscriptionAggregator::new());
        transcriptions.listen(&transcription_receiver);

        let messages = SessionMessages::new(
            room.local_identity(),
            chat.messages().watch(),
            transcriptions.transcriptions().watch(),
            agent.identities().watch(),
            agent.remote_participants().watch(),
        );

        Ok(Self {
            room,
            token_source,
            options,
            chat,
            agent,
            transcriptions,
            messages,
            agent_timeout: Mutex::new(None),
            _transcription_receiver: transcription_receiver,
        })
    }

    /// Fetches credentials, connects and waits for the agent in the
    /// background. The agent is marked failed if it is not available within
    /// the configured timeout.
    pub async fn start(&self) -> SessionResult<()> {
        let TokenSourceResponse { server_url, participant_token } =
            self.token_source.fetch().await?;
        self.agent.clear_failure();
        self.room.connect(&server_url, &participant_token).await?;
        log::info!("session connected to {}", server_url);

        let agent = self.agent.clone();
        let timeout = self.options.agent_connect_timeout;
        let wait = agent.wait_until_available();
        let task = tokio::spawn(async move {
            if tokio::time::timeout(timeout, wait).await.is_err() {
                agent.fail(AGENT_DID_NOT_JOIN);
            }
        });
        if let Some(previous) = self.agent_timeout.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Disconnects and waits until the room reports it.
    pub async fn end(&self) -> SessionResult<()> {
        if let Some(task) = self.agent_timeout.lock().take() {
            task.abort();
        }
        self.room.disconnect().await;
        self.agent.wait_until_disconnected().await?;
        Ok(())
    }

    /// Resolves once the agent is available, or with an error once it has
    /// failed.
    pub async fn wait_until_agent_available(&self) -> SessionResult<AgentState> {
        let state = self
            .agent
            .state_observable()
            .wait_until(|state| state.is_available() || *state == AgentState::Failed)
            .await?;
        if state == AgentState::Failed {
            let reason = self.agent.failure_reason().unwrap_or_default();
            return Err(SessionError::AgentFailed(reason));
        }
        Ok(state)
    }

    pub async fn send(&self, message: &str) -> ChatResult<ChatMessage> {
        self.chat.send(message).await
    }

    pub fn room(&self) -> &Arc<T> {
        &self.room
    }

    pub fn chat(&self) -> &Arc<Chat<T>> {
        &self.chat
    }

    pub fn agent(&self) -> &Arc<Agent<T>> {
        &self.agent
    }

    pub fn transcriptions(&self) -> &Arc<TranscriptionAggregator> {
        &self.transcriptions
    }

    pub fn messages(&self) -> &SessionMessages {
        &self.messages
    }
}

impl<T: Transport, S: TokenSource> Drop for Session<T, S> {
    fn drop(&mut self) {
        if let Some(task) = self.agent_timeout.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        room::{
            loopback::{LoopbackRoom, LoopbackServer},
            ParticipantInfo, ParticipantKind,
        },
        token_source::TokenSourceLiteral,
    };

    fn session(
        server: &LoopbackServer,
        timeout: Duration,
    ) -> Session<LoopbackRoom, TokenSourceLiteral<TokenSourceResponse>> {
        let room = server.room(ParticipantInfo::new("user", ParticipantKind::Standard));
        Session::new(
            room,
            TokenSourceLiteral::from_parts("loopback://", "token"),
            SessionOptions { agent_connect_timeout: timeout, ..Default::default() },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_timeout() {
        let server = LoopbackServer::default();
        let session = session(&server, Duration::from_secs(20));
        session.start().await.unwrap();
        assert_eq!(session.agent().state(), AgentState::Initializing);

        let result = session.wait_until_agent_available().await;
        assert!(matches!(
            result,
            Err(SessionError::AgentFailed(reason)) if reason == AGENT_DID_NOT_JOIN
        ));
        assert_eq!(session.agent().state(), AgentState::Failed);
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let server = LoopbackServer::default();
        let room = server.room(ParticipantInfo::new("user", ParticipantKind::Standard));
        let session = Session::new(
            room,
            TokenSourceLiteral::from_parts("loopback://", ""),
            SessionOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            session.start().await,
            Err(SessionError::Transport(TransportError::InvalidToken(_)))
        ));
    }
}
