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

pub use crate::agent::{Agent, AgentIdentities, AgentState};
pub use crate::chat::{Chat, ChatError, ChatMessage, ChatOptions, ChatResult};
pub use crate::messages::{ReceivedMessage, ReceivedMessageKind, SessionMessages};
pub use crate::observable::{Observable, ObservableError};
pub use crate::room::{
    ConnectionState, ParticipantInfo, ParticipantKind, RoomEvent, StreamTextOptions, TrackSource,
    Transport, TransportError,
};
pub use crate::session::{Session, SessionError, SessionOptions, SessionResult};
pub use crate::text_stream::{TextStreamData, TextStreamReceiver};
pub use crate::token_source::{
    TokenSource, TokenSourceEnvironment, TokenSourceLiteral, TokenSourceResponse,
};
pub use crate::transcriptions::TranscriptionAggregator;

pub use crate::id::*;
