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

#![allow(dead_code)]

use anyhow::{Context, Result};
use livekit_components::{
    agent::{AGENT_STATE_ATTRIBUTE, PUBLISH_ON_BEHALF_ATTRIBUTE},
    room::{
        loopback::{LoopbackOptions, LoopbackRoom, LoopbackServer},
        ParticipantInfo, ParticipantKind, RoomEvent, Transport,
    },
};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedReceiver;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Creates the specified number of connected participants in a shared room.
/// Participant `n` has the identity `p{n}`.
pub async fn test_rooms(
    count: usize,
) -> Result<Vec<(Arc<LoopbackRoom>, UnboundedReceiver<RoomEvent>)>> {
    test_rooms_with_options(count, LoopbackOptions::default()).await
}

pub async fn test_rooms_with_options(
    count: usize,
    options: LoopbackOptions,
) -> Result<Vec<(Arc<LoopbackRoom>, UnboundedReceiver<RoomEvent>)>> {
    let server = LoopbackServer::new(options);
    let mut rooms = Vec::with_capacity(count);
    for id in 0..count {
        let room = server.room(ParticipantInfo::new(format!("p{}", id), ParticipantKind::Standard));
        let events = room.subscribe();
        room.connect("loopback://test", "token").await.context("Failed to connect to room")?;
        rooms.push((room, events));
    }
    Ok(rooms)
}

/// Connects a participant to the room served by `server`.
pub async fn join(server: &LoopbackServer, info: ParticipantInfo) -> Result<Arc<LoopbackRoom>> {
    let room = server.room(info);
    room.connect("loopback://test", "token").await.context("Failed to connect to room")?;
    Ok(room)
}

/// Participant info of an agent publishing `state`.
pub fn agent_info(identity: &str, state: &str) -> ParticipantInfo {
    ParticipantInfo::new(identity, ParticipantKind::Agent)
        .with_attributes(attributes(&[(AGENT_STATE_ATTRIBUTE, state)]))
}

/// Participant info of a worker publishing on behalf of `agent`.
pub fn worker_info(identity: &str, agent: &str) -> ParticipantInfo {
    ParticipantInfo::new(identity, ParticipantKind::Agent)
        .with_attributes(attributes(&[(PUBLISH_ON_BEHALF_ATTRIBUTE, agent)]))
}

pub fn attributes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Fails the test instead of hanging when `future` takes too long.
pub async fn within<F: Future>(future: F) -> Result<F::Output> {
    tokio::time::timeout(TIMEOUT, future).await.context("Timed out")
}
