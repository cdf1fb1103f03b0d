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

use super::{
    create_random_uuid, proto, OperationType, StreamError, StreamProgress, StreamResult,
    TextStreamInfo,
};
use crate::{id::ParticipantIdentity, room::utils::utf8_chunk::Utf8AwareChunkExt};
use chrono::Utc;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};
use tokio::sync::Mutex;

pub(crate) const CHUNK_SIZE: usize = 15_000;

/// Destination for outgoing stream packets.
pub(crate) trait PacketSink: Send + Sync + 'static {
    fn send_packet(
        &self,
        packet: proto::Packet,
        destination_identities: &[ParticipantIdentity],
    ) -> Pin<Box<dyn Future<Output = StreamResult<()>> + Send + '_>>;
}

/// Writer for an open data stream.
pub trait StreamWriter<'a> {
    /// Type of input this writer accepts.
    type Input: 'a;

    /// Information about the underlying data stream.
    type Info;

    /// Returns a reference to the stream info.
    fn info(&self) -> &Self::Info;

    /// Writes to the stream.
    fn write(&self, input: Self::Input) -> impl Future<Output = StreamResult<()>> + Send;

    /// Closes the stream normally.
    fn close(self) -> impl Future<Output = StreamResult<()>> + Send;

    /// Closes the stream abnormally, specifying the reason for closure.
    fn close_with_reason(self, reason: &str) -> impl Future<Output = StreamResult<()>> + Send;
}

/// Writer for an open text data stream.
#[derive(Clone)]
pub struct TextStreamWriter {
    info: Arc<TextStreamInfo>,
    stream: Arc<Mutex<RawStream>>,
}

impl<'a> StreamWriter<'a> for TextStreamWriter {
    type Input = &'a str;
    type Info = TextStreamInfo;

    fn info(&self) -> &Self::Info {
        &self.info
    }

    async fn write(&self, text: &'a str) -> StreamResult<()> {
        let mut stream = self.stream.lock().await;
        if text.is_empty() {
            return stream.write_chunk(&[]).await;
        }
        for chunk in text.as_bytes().utf8_aware_chunks(CHUNK_SIZE) {
            stream.write_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.stream.lock().await.close(None).await
    }

    async fn close_with_reason(self, reason: &str) -> StreamResult<()> {
        self.stream.lock().await.close(Some(reason)).await
    }
}

impl TextStreamWriter {
    pub(crate) async fn open(
        sink: Arc<dyn PacketSink>,
        options: StreamTextOptions,
        total_length: Option<u64>,
    ) -> StreamResult<Self> {
        let id = options.id.unwrap_or_else(create_random_uuid);
        let info = TextStreamInfo {
            id: id.clone(),
            topic: options.topic,
            timestamp: Utc::now(),
            total_length,
            attributes: options.attributes,
            mime_type: "text/plain".to_owned(),
            operation_type: options.operation_type.unwrap_or(OperationType::Create),
            version: options.version.unwrap_or_default(),
            reply_to_stream_id: options.reply_to_stream_id,
            attached_stream_ids: options.attached_stream_ids,
            generated: options.generated.unwrap_or(false),
        };
        let header = proto::Header {
            stream_id: id,
            timestamp: info.timestamp.timestamp_millis(),
            topic: info.topic.clone(),
            mime_type: info.mime_type.clone(),
            total_length,
            attributes: info.attributes.clone(),
            text_header: Some(proto::TextHeader {
                operation_type: info.operation_type.into(),
                version: info.version,
                reply_to_stream_id: info.reply_to_stream_id.clone().unwrap_or_default(),
                attached_stream_ids: info.attached_stream_ids.clone(),
                generated: info.generated,
            }),
        };
        let stream = RawStream::open(sink, header, options.destination_identities).await?;
        Ok(Self { info: Arc::new(info), stream: Arc::new(Mutex::new(stream)) })
    }

    /// Sends `text` as one complete stream.
    pub(crate) async fn send_text(
        sink: Arc<dyn PacketSink>,
        text: &str,
        options: StreamTextOptions,
    ) -> StreamResult<TextStreamInfo> {
        let writer = Self::open(sink, options, Some(text.len() as u64)).await?;
        writer.write(text).await?;
        let info = writer.info().clone();
        writer.close().await?;
        Ok(info)
    }
}

struct RawStream {
    id: String,
    progress: StreamProgress,
    is_closed: bool,
    destination_identities: Vec<ParticipantIdentity>,
    sink: Arc<dyn PacketSink>,
}

impl RawStream {
    async fn open(
        sink: Arc<dyn PacketSink>,
        header: proto::Header,
        destination_identities: Vec<ParticipantIdentity>,
    ) -> StreamResult<Self> {
        let id = header.stream_id.clone();
        let bytes_total = header.total_length;
        sink.send_packet(proto::Packet::StreamHeader(header), &destination_identities).await?;

        Ok(Self {
            id,
            progress: StreamProgress { bytes_total, ..Default::default() },
            is_closed: false,
            destination_identities,
            sink,
        })
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> StreamResult<()> {
        if self.is_closed {
            Err(StreamError::AlreadyClosed)?
        }
        let chunk = proto::Chunk {
            stream_id: self.id.clone(),
            chunk_index: self.progress.chunk_index,
            content: bytes.to_vec(),
        };
        self.sink
            .send_packet(proto::Packet::StreamChunk(chunk), &self.destination_identities)
            .await?;
        self.progress.bytes_processed += bytes.len() as u64;
        self.progress.chunk_index += 1;
        Ok(())
    }

    async fn close(&mut self, reason: Option<&str>) -> StreamResult<()> {
        if self.is_closed {
            Err(StreamError::AlreadyClosed)?
        }
        let packet = Self::create_trailer_packet(&self.id, reason);
        self.sink.send_packet(packet, &self.destination_identities).await?;
        self.is_closed = true;
        Ok(())
    }

    fn create_trailer_packet(id: &str, reason: Option<&str>) -> proto::Packet {
        proto::Packet::StreamTrailer(proto::Trailer {
            stream_id: id.to_owned(),
            reason: reason.unwrap_or_default().to_owned(),
        })
    }
}

impl Drop for RawStream {
    /// Close stream normally if not already closed.
    fn drop(&mut self) {
        if self.is_closed {
            return;
        }
        let packet = Self::create_trailer_packet(&self.id, None);
        let sink = self.sink.clone();
        let destination_identities = std::mem::take(&mut self.destination_identities);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("Stream '{}' dropped outside of a runtime, trailer not sent", self.id);
            return;
        };
        handle.spawn(async move {
            let _ = sink.send_packet(packet, &destination_identities).await;
        });
    }
}

/// Options used when opening an outgoing text data stream.
#[derive(Clone, Debug, Default)]
pub struct StreamTextOptions {
    pub topic: String,
    pub attributes: HashMap<String, String>,
    pub destination_identities: Vec<ParticipantIdentity>,
    /// Stream id to use instead of a generated one.
    pub id: Option<String>,
    pub operation_type: Option<OperationType>,
    pub version: Option<i32>,
    pub reply_to_stream_id: Option<String>,
    pub attached_stream_ids: Vec<String>,
    pub generated: Option<bool>,
}
