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

//! Packets of the chunked data stream protocol.
//!
//! A stream is a header, any number of chunks with consecutive indices, and a
//! trailer. An empty trailer reason marks a normal close.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OperationType {
    #[default]
    Create,
    Update,
    Delete,
    Reaction,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextHeader {
    pub operation_type: OperationType,
    pub version: i32,
    pub reply_to_stream_id: String,
    pub attached_stream_ids: Vec<String>,
    pub generated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub stream_id: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub topic: String,
    pub mime_type: String,
    pub total_length: Option<u64>,
    pub attributes: HashMap<String, String>,
    pub text_header: Option<TextHeader>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub stream_id: String,
    pub chunk_index: u64,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trailer {
    pub stream_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    StreamHeader(Header),
    StreamChunk(Chunk),
    StreamTrailer(Trailer),
}

impl Packet {
    pub fn stream_id(&self) -> &str {
        match self {
            Packet::StreamHeader(header) => &header.stream_id,
            Packet::StreamChunk(chunk) => &chunk.stream_id,
            Packet::StreamTrailer(trailer) => &trailer.stream_id,
        }
    }
}
