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

use super::{proto, StreamError, StreamProgress, StreamResult, TextStreamInfo};
use crate::id::ParticipantIdentity;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    error::Error,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Reader for an incoming data stream.
pub trait StreamReader: Stream<Item = StreamResult<(Self::Output, StreamProgress)>> {
    /// Type of output this reader produces.
    type Output;

    /// Information about the underlying data stream.
    type Info;

    /// Returns a reference to the stream info.
    fn info(&self) -> &Self::Info;

    /// Reads all incoming chunks from the stream, concatenating them
    /// into a single value which is returned once the stream closes normally.
    fn read_all(self) -> impl Future<Output = StreamResult<Self::Output>> + Send;
}

type ChunkSender = UnboundedSender<StreamResult<IncomingChunk>>;
type ChunkReceiver = UnboundedReceiver<StreamResult<IncomingChunk>>;

/// Reader for an incoming text data stream.
pub struct TextStreamReader {
    info: TextStreamInfo,
    rx: ChunkReceiver,
}

impl TextStreamReader {
    fn new(info: TextStreamInfo) -> (Self, ChunkSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { info, rx }, tx)
    }
}

impl StreamReader for TextStreamReader {
    type Output = String;
    type Info = TextStreamInfo;

    fn info(&self) -> &TextStreamInfo {
        &self.info
    }

    async fn read_all(mut self) -> StreamResult<String> {
        let mut result = String::new();
        while let Some(chunk) = self.next().await {
            let (text, _) = chunk?;
            result.push_str(&text);
        }
        Ok(result)
    }
}

impl Stream for TextStreamReader {
    type Item = StreamResult<(String, StreamProgress)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => match String::from_utf8(chunk.content.into()) {
                Ok(content) => Poll::Ready(Some(Ok((content, chunk.progress)))),
                Err(e) => {
                    this.rx.close();
                    Poll::Ready(Some(Err(StreamError::from(e))))
                }
            },
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct IncomingChunk {
    progress: StreamProgress,
    content: Bytes,
}

struct Descriptor {
    progress: StreamProgress,
    chunk_tx: ChunkSender,
    sender: ParticipantIdentity,
}

/// Turns header, chunk and trailer packets into readers handed to the
/// handler registered for the stream's topic.
#[derive(Default)]
pub(crate) struct IncomingStreamManager {
    open_streams: HashMap<String, Descriptor>,
    unhandled_topics: HashSet<String>,
    pub(crate) handlers: HandlerRegistry,
}

impl IncomingStreamManager {
    pub fn handle_packet(&mut self, packet: proto::Packet, identity: &ParticipantIdentity) {
        match packet {
            proto::Packet::StreamHeader(header) => self.handle_header(header, identity.clone()),
            proto::Packet::StreamChunk(chunk) => self.handle_chunk(chunk),
            proto::Packet::StreamTrailer(trailer) => self.handle_trailer(trailer),
        }
    }

    /// Handles an incoming header packet.
    pub fn handle_header(&mut self, header: proto::Header, identity: ParticipantIdentity) {
        let Ok(info) =
            TextStreamInfo::try_from(header).inspect_err(|e| log::error!("Invalid header: {}", e))
        else {
            return;
        };

        let id = info.id.clone();
        let topic = info.topic.clone();
        let bytes_total = info.total_length;

        if self.open_streams.contains_key(&id) {
            log::error!("Stream '{}' already open", id);
            return;
        }

        let (reader, chunk_tx) = TextStreamReader::new(info);
        if !self.handlers.dispatch(reader, identity.clone()) {
            if self.unhandled_topics.insert(topic.clone()) {
                log::debug!("No handler registered for text streams on topic '{}'", topic);
            }
            return;
        }

        let descriptor = Descriptor {
            progress: StreamProgress { bytes_total, ..Default::default() },
            chunk_tx,
            sender: identity,
        };
        self.open_streams.insert(id, descriptor);
    }

    /// Handles an incoming chunk packet.
    pub fn handle_chunk(&mut self, chunk: proto::Chunk) {
        let id = chunk.stream_id;
        let Some(descriptor) = self.open_streams.get_mut(&id) else {
            return;
        };

        if descriptor.progress.chunk_index != chunk.chunk_index {
            self.close_stream_with_error(&id, StreamError::MissedChunk);
            return;
        }

        descriptor.progress.chunk_index += 1;
        descriptor.progress.bytes_processed += chunk.content.len() as u64;

        if match descriptor.progress.bytes_total {
            Some(total) => descriptor.progress.bytes_processed > total,
            None => false,
        } {
            self.close_stream_with_error(&id, StreamError::LengthExceeded);
            return;
        }

        let chunk =
            IncomingChunk { progress: descriptor.progress, content: Bytes::from(chunk.content) };
        self.yield_chunk(&id, chunk);
    }

    /// Handles an incoming trailer packet.
    pub fn handle_trailer(&mut self, trailer: proto::Trailer) {
        let id = trailer.stream_id;
        let Some(descriptor) = self.open_streams.get_mut(&id) else {
            return;
        };

        if !match descriptor.progress.bytes_total {
            Some(total) => descriptor.progress.bytes_processed >= total,
            None => true,
        } {
            self.close_stream_with_error(&id, StreamError::Incomplete);
            return;
        }
        if !trailer.reason.is_empty() {
            self.close_stream_with_error(&id, StreamError::AbnormalEnd(trailer.reason));
            return;
        }
        self.close_stream(&id);
    }

    /// Terminates the open streams of a participant that left the room.
    pub fn terminate_streams_from(&mut self, identity: &ParticipantIdentity) {
        let ids: Vec<String> = self
            .open_streams
            .iter()
            .filter(|(_, descriptor)| &descriptor.sender == identity)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.close_stream_with_error(&id, StreamError::Terminated);
        }
    }

    fn yield_chunk(&mut self, id: &str, chunk: IncomingChunk) {
        let Some(descriptor) = self.open_streams.get_mut(id) else {
            return;
        };
        if descriptor.chunk_tx.send(Ok(chunk)).is_err() {
            // Reader has been dropped, close the stream.
            self.close_stream(id);
        }
    }

    fn close_stream(&mut self, id: &str) {
        // Dropping the sender closes the channel.
        self.open_streams.remove(id);
    }

    fn close_stream_with_error(&mut self, id: &str, error: StreamError) {
        if let Some(descriptor) = self.open_streams.remove(id) {
            let _ = descriptor.chunk_tx.send(Err(error));
        }
    }
}

type StreamHandlerResult = Result<(), Box<dyn Error + Send + Sync>>;
pub type StreamHandlerFuture = Pin<Box<dyn Future<Output = StreamHandlerResult> + Send>>;

pub type TextStreamHandler =
    Arc<dyn Fn(TextStreamReader, ParticipantIdentity) -> StreamHandlerFuture + Send + Sync>;

/// Registry for incoming text stream handlers, at most one per topic.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    text_handlers: HashMap<String, TextStreamHandler>,
}

impl HandlerRegistry {
    pub fn register_text_stream_handler(
        &mut self,
        topic: &str,
        handler: TextStreamHandler,
    ) -> StreamResult<()> {
        if self.text_handlers.contains_key(topic) {
            Err(StreamError::HandlerAlreadyRegistered)?
        }
        self.text_handlers.insert(topic.to_owned(), handler);
        Ok(())
    }

    pub fn unregister_text_stream_handler(&mut self, topic: &str) {
        self.text_handlers.remove(topic);
    }

    /// Dispatch the given stream reader to a registered handler (if one is registered).
    fn dispatch(&self, reader: TextStreamReader, identity: ParticipantIdentity) -> bool {
        let Some(handler) = self.text_handlers.get(&reader.info().topic) else {
            return false;
        };
        let topic = reader.info().topic.clone();
        let future = handler(reader, identity);
        tokio::spawn(async move {
            if let Err(e) = future.await {
                log::error!("Text stream handler for topic '{}' failed: {}", topic, e);
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TOPIC: &str = "some-topic";

    fn header(id: &str, total_length: Option<u64>) -> proto::Header {
        proto::Header {
            stream_id: id.to_owned(),
            topic: TOPIC.to_owned(),
            total_length,
            text_header: Some(proto::TextHeader::default()),
            ..Default::default()
        }
    }

    fn chunk(id: &str, index: u64, content: &str) -> proto::Chunk {
        proto::Chunk {
            stream_id: id.to_owned(),
            chunk_index: index,
            content: content.as_bytes().to_vec(),
        }
    }

    fn trailer(id: &str, reason: &str) -> proto::Trailer {
        proto::Trailer { stream_id: id.to_owned(), reason: reason.to_owned() }
    }

    fn manager_with_reader_tx() -> (IncomingStreamManager, mpsc::UnboundedReceiver<TextStreamReader>)
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut manager = IncomingStreamManager::default();
        manager
            .handlers
            .register_text_stream_handler(
                TOPIC,
                Arc::new(move |reader, _| {
                    let _ = tx.send(reader);
                    Box::pin(async { Ok(()) })
                }),
            )
            .unwrap();
        (manager, rx)
    }

    #[tokio::test]
    async fn test_read_all() {
        let (mut manager, mut readers) = manager_with_reader_tx();
        let identity = ParticipantIdentity::from("sender");
        manager.handle_header(header("a", Some(11)), identity);
        manager.handle_chunk(chunk("a", 0, "hello"));
        manager.handle_chunk(chunk("a", 1, " world"));
        manager.handle_trailer(trailer("a", ""));

        let reader = tokio::time::timeout(Duration::from_secs(1), readers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reader.read_all().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_missed_chunk() {
        let (mut manager, mut readers) = manager_with_reader_tx();
        manager.handle_header(header("a", None), ParticipantIdentity::from("sender"));
        manager.handle_chunk(chunk("a", 1, "skipped"));

        let reader = readers.recv().await.unwrap();
        assert!(matches!(reader.read_all().await, Err(StreamError::MissedChunk)));
    }

    #[tokio::test]
    async fn test_abnormal_end() {
        let (mut manager, mut readers) = manager_with_reader_tx();
        manager.handle_header(header("a", None), ParticipantIdentity::from("sender"));
        manager.handle_trailer(trailer("a", "cancelled"));

        let reader = readers.recv().await.unwrap();
        assert!(matches!(reader.read_all().await, Err(StreamError::AbnormalEnd(_))));
    }

    #[tokio::test]
    async fn test_incomplete() {
        let (mut manager, mut readers) = manager_with_reader_tx();
        manager.handle_header(header("a", Some(10)), ParticipantIdentity::from("sender"));
        manager.handle_chunk(chunk("a", 0, "short"));
        manager.handle_trailer(trailer("a", ""));

        let reader = readers.recv().await.unwrap();
        assert!(matches!(reader.read_all().await, Err(StreamError::Incomplete)));
    }

    #[test]
    fn test_register_twice() {
        let mut registry = HandlerRegistry::default();
        let handler: TextStreamHandler = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        assert!(registry.register_text_stream_handler(TOPIC, handler.clone()).is_ok());
        assert!(matches!(
            registry.register_text_stream_handler(TOPIC, handler.clone()),
            Err(StreamError::HandlerAlreadyRegistered)
        ));
        registry.unregister_text_stream_handler(TOPIC);
        assert!(registry.register_text_stream_handler(TOPIC, handler).is_ok());
    }

    #[tokio::test]
    async fn test_terminate_streams_from() {
        let (mut manager, mut readers) = manager_with_reader_tx();
        manager.handle_header(header("a", None), ParticipantIdentity::from("leaving"));
        manager.handle_header(header("b", None), ParticipantIdentity::from("staying"));
        manager.terminate_streams_from(&ParticipantIdentity::from("leaving"));

        let first = readers.recv().await.unwrap();
        assert!(matches!(first.read_all().await, Err(StreamError::Terminated)));
        assert!(manager.open_streams.contains_key("b"));
    }

    #[tokio::test]
    async fn test_unhandled_topic_is_ignored() {
        let mut manager = IncomingStreamManager::default();
        manager.handle_header(header("a", None), ParticipantIdentity::from("sender"));
        manager.handle_chunk(chunk("a", 0, "dropped"));
        assert!(manager.open_streams.is_empty());
    }
}
