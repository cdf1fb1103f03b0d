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

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::{
    id::ParticipantIdentity,
    room::{StreamReader, StreamResult, TextStreamInfo, TextStreamReader, Transport},
};

/// Accumulated text of one incoming stream.
#[derive(Clone, Debug, PartialEq)]
pub struct TextStreamData {
    pub participant_identity: ParticipantIdentity,
    pub stream_info: Arc<TextStreamInfo>,
    pub text: String,
}

/// Reassembles the text streams received on one topic.
///
/// Every chunk appends to the text of its stream and publishes the
/// cumulative value. Chunks are applied in delivery order; the transport is
/// trusted to deliver them in order.
///
/// The topic handler stays registered for the lifetime of the receiver.
/// Dropping the receiver unregisters it, stops in-flight streams and ends
/// every subscription.
pub struct TextStreamReceiver<T: Transport> {
    room: Arc<T>,
    topic: String,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    /// Set once the receiver is dropped; in-flight readers stop on it.
    close_tx: watch::Sender<bool>,
}

impl Default for Shared {
    fn default() -> Self {
        let (close_tx, _) = watch::channel(false);
        Self { state: Mutex::default(), close_tx }
    }
}

#[derive(Default)]
struct State {
    /// Streams that have received at least one chunk and no trailer yet,
    /// in the order they were first seen.
    open: Vec<TextStreamData>,
    subscribers: Vec<mpsc::UnboundedSender<TextStreamData>>,
    closed: bool,
}

impl<T: Transport> TextStreamReceiver<T> {
    /// Registers a handler for `topic` on the room.
    ///
    /// At most one receiver may exist per topic and room.
    pub fn register(room: Arc<T>, topic: impl Into<String>) -> StreamResult<Self> {
        let topic = topic.into();
        let shared = Arc::new(Shared::default());
        let handler_shared = shared.clone();
        room.register_text_stream_handler(
            &topic,
            Arc::new(move |reader, identity| {
                let shared = handler_shared.clone();
                Box::pin(async move {
                    shared.read_stream(reader, identity).await;
                    Ok(())
                })
            }),
        )?;
        log::debug!("registered text stream receiver for topic '{}'", topic);
        Ok(Self { room, topic, shared })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current value of every open stream.
    pub fn open_streams(&self) -> Vec<TextStreamData> {
        self.shared.state.lock().open.clone()
    }

    /// Returns a receiver yielding the accumulated value of every open stream
    /// followed by each later update, one per chunk.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TextStreamData> {
        let mut state = self.shared.state.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        if state.closed {
            return rx;
        }
        for data in &state.open {
            let _ = tx.send(data.clone());
        }
        state.subscribers.push(tx);
        rx
    }
}

impl<T: Transport> Drop for TextStreamReceiver<T> {
    fn drop(&mut self) {
        self.room.unregister_text_stream_handler(&self.topic);
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.open.clear();
        state.subscribers.clear();
        drop(state);
        self.shared.close_tx.send_replace(true);
        log::debug!("unregistered text stream receiver for topic '{}'", self.topic);
    }
}

impl Shared {
    async fn read_stream(&self, mut reader: TextStreamReader, identity: ParticipantIdentity) {
        let info = Arc::new(reader.info().clone());
        let mut close_rx = self.close_tx.subscribe();
        loop {
            let result = tokio::select! {
                result = reader.next() => result,
                _ = close_rx.wait_for(|closed| *closed) => {
                    log::debug!("text stream '{}' stopped, receiver dropped", info.id);
                    return;
                }
            };
            let Some(result) = result else {
                break;
            };
            match result {
                Ok((chunk, _)) => {
                    if !self.append(&info, &identity, &chunk) {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("text stream '{}' on '{}' failed: {}", info.id, info.topic, e);
                    break;
                }
            }
        }
        self.finish(&info.id);
    }

    /// Appends a chunk and publishes the new value. Returns false once the
    /// receiver has been dropped.
    fn append(&self, info: &Arc<TextStreamInfo>, identity: &ParticipantIdentity, chunk: &str) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let data = match state.open.iter_mut().find(|data| data.stream_info.id == info.id) {
            Some(data) => {
                data.text.push_str(chunk);
                data.clone()
            }
            None => {
                let data = TextStreamData {
                    participant_identity: identity.clone(),
                    stream_info: info.clone(),
                    text: chunk.to_owned(),
                };
                state.open.push(data.clone());
                data
            }
        };
        state.subscribers.retain(|tx| tx.send(data.clone()).is_ok());
        true
    }

    fn finish(&self, stream_id: &str) {
        self.state.lock().open.retain(|data| data.stream_info.id != stream_id);
    }
}
