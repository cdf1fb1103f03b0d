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

use thiserror::Error;

mod incoming;
mod info;
mod outgoing;
pub mod proto;

pub use incoming::{StreamHandlerFuture, StreamReader, TextStreamHandler, TextStreamReader};
pub(crate) use incoming::IncomingStreamManager;
pub use info::{OperationType, TextStreamInfo};
pub use outgoing::{StreamTextOptions, StreamWriter, TextStreamWriter};
pub(crate) use outgoing::{PacketSink, CHUNK_SIZE};

pub(crate) fn create_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Progress of an incoming or outgoing data stream.
#[derive(Clone, Copy, Default, Debug, Hash, Eq, PartialEq)]
pub struct StreamProgress {
    pub chunk_index: u64,
    pub bytes_processed: u64,
    pub bytes_total: Option<u64>,
}

impl StreamProgress {
    pub fn percentage(&self) -> Option<f32> {
        self.bytes_total.map(|total| self.bytes_processed as f32 / total as f32)
    }
}

/// Result type for data stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Error type for data stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream with this ID is already opened")]
    AlreadyOpened,

    #[error("stream has already been closed")]
    AlreadyClosed,

    #[error("stream closed abnormally: {0}")]
    AbnormalEnd(String),

    #[error("UTF-8 decoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("incoming header was invalid")]
    InvalidHeader,

    #[error("expected chunk index to be exactly one more than the previous")]
    MissedChunk,

    #[error("read length exceeded total length specified in stream header")]
    LengthExceeded,

    #[error("stream data is incomplete")]
    Incomplete,

    #[error("stream terminated before completion")]
    Terminated,

    #[error("cannot perform operations on unknown stream")]
    UnknownStream,

    #[error("handler already registered for this stream type")]
    HandlerAlreadyRegistered,

    #[error("unable to send packet")]
    SendFailed,

    #[error("internal error")]
    Internal,
}
