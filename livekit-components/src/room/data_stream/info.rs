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

use super::{proto, StreamError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Information about a text data stream.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TextStreamInfo {
    pub id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub total_length: Option<u64>,
    pub attributes: HashMap<String, String>,
    pub mime_type: String,
    pub operation_type: OperationType,
    pub version: i32,
    pub reply_to_stream_id: Option<String>,
    pub attached_stream_ids: Vec<String>,
    pub generated: bool,
}

/// Operation type for text streams.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
#[non_exhaustive]
pub enum OperationType {
    #[default]
    Create,
    Update,
    Delete,
    Reaction,
}

impl TextStreamInfo {
    /// Info for a stream that has not been through the wire, mainly useful
    /// to feed aggregators directly.
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            timestamp: Utc::now(),
            total_length: None,
            attributes: HashMap::new(),
            mime_type: "text/plain".to_owned(),
            operation_type: OperationType::Create,
            version: 0,
            reply_to_stream_id: None,
            attached_stream_ids: Vec::new(),
            generated: false,
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

// MARK: - Protocol type conversion

impl TryFrom<proto::Header> for TextStreamInfo {
    type Error = StreamError;

    fn try_from(mut header: proto::Header) -> Result<Self, Self::Error> {
        let Some(text_header) = header.text_header.take() else {
            Err(StreamError::InvalidHeader)?
        };
        let timestamp =
            DateTime::<Utc>::from_timestamp_millis(header.timestamp).unwrap_or_else(Utc::now);
        Ok(TextStreamInfo {
            id: header.stream_id,
            topic: header.topic,
            timestamp,
            total_length: header.total_length,
            attributes: header.attributes,
            mime_type: header.mime_type,
            operation_type: text_header.operation_type.into(),
            version: text_header.version,
            reply_to_stream_id: (!text_header.reply_to_stream_id.is_empty())
                .then_some(text_header.reply_to_stream_id),
            attached_stream_ids: text_header.attached_stream_ids,
            generated: text_header.generated,
        })
    }
}

impl From<proto::OperationType> for OperationType {
    fn from(op_type: proto::OperationType) -> Self {
        match op_type {
            proto::OperationType::Create => OperationType::Create,
            proto::OperationType::Update => OperationType::Update,
            proto::OperationType::Delete => OperationType::Delete,
            proto::OperationType::Reaction => OperationType::Reaction,
        }
    }
}

impl From<OperationType> for proto::OperationType {
    fn from(op_type: OperationType) -> Self {
        match op_type {
            OperationType::Create => proto::OperationType::Create,
            OperationType::Update => proto::OperationType::Update,
            OperationType::Delete => proto::OperationType::Delete,
            OperationType::Reaction => proto::OperationType::Reaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_without_text_content_is_invalid() {
        let header = proto::Header { stream_id: "s".into(), ..Default::default() };
        assert!(matches!(TextStreamInfo::try_from(header), Err(StreamError::InvalidHeader)));
    }

    #[test]
    fn test_header_conversion() {
        let header = proto::Header {
            stream_id: "stream".into(),
            timestamp: 1_700_000_000_000,
            topic: "lk.chat".into(),
            mime_type: "text/plain".into(),
            total_length: Some(5),
            attributes: HashMap::from([("k".to_owned(), "v".to_owned())]),
            text_header: Some(proto::TextHeader {
                operation_type: proto::OperationType::Update,
                reply_to_stream_id: String::new(),
                ..Default::default()
            }),
        };
        let info = TextStreamInfo::try_from(header).unwrap();
        assert_eq!(info.id, "stream");
        assert_eq!(info.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(info.operation_type, OperationType::Update);
        assert_eq!(info.reply_to_stream_id, None);
        assert_eq!(info.attributes.get("k").map(String::as_str), Some("v"));
    }
}
