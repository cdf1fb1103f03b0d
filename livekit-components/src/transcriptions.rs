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
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::{
    observable::Observable,
    room::Transport,
    text_stream::{TextStreamData, TextStreamReceiver},
};

pub const TRANSCRIPTION_TOPIC: &str = "lk.transcription";
pub const SEGMENT_ID_ATTRIBUTE: &str = "lk.segment_id";
pub const TRANSCRIPTION_FINAL_ATTRIBUTE: &str = "lk.transcription_final";
pub const TRANSCRIBED_TRACK_ID_ATTRIBUTE: &str = "lk.transcribed_track_id";

/// Segment a transcription stream belongs to. A segment may span several
/// streams when the sender resumes it under a new stream id.
pub fn segment_id(data: &TextStreamData) -> Option<&str> {
    data.stream_info.attributes.get(SEGMENT_ID_ATTRIBUTE).map(String::as_str)
}

/// Whether the sender marked the segment as final.
pub fn is_final(data: &TextStreamData) -> bool {
    data.stream_info.attributes.get(TRANSCRIPTION_FINAL_ATTRIBUTE).is_some_and(|v| v == "true")
}

pub fn transcribed_track_id(data: &TextStreamData) -> Option<&str> {
    data.stream_info.attributes.get(TRANSCRIBED_TRACK_ID_ATTRIBUTE).map(String::as_str)
}

/// Ordered list of transcription segments.
///
/// Updates for a known stream id replace that entry. Updates for a new
/// stream id carrying a known segment id replace the entry of that segment
/// in place. Anything else is appended. Entries are never removed.
pub struct TranscriptionAggregator {
    entries: Mutex<Vec<TextStreamData>>,
    transcriptions: Observable<Arc<Vec<TextStreamData>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TranscriptionAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptionAggregator {
    pub fn new() -> Self {
        Self {
            entries: Mutex::default(),
            transcriptions: Observable::new(Arc::new(Vec::new())),
            tasks: Mutex::default(),
        }
    }

    /// Feeds every update of `receiver` into the aggregator until the
    /// receiver is dropped.
    pub fn listen<T: Transport>(self: &Arc<Self>, receiver: &TextStreamReceiver<T>) {
        let mut updates = receiver.subscribe();
        let aggregator = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(data) = updates.recv().await {
                let Some(aggregator) = Weak::upgrade(&aggregator) else {
                    break;
                };
                aggregator.apply_update(data);
            }
        });
        self.tasks.lock().push(task);
    }

    /// Merges one cumulative stream update and publishes the resulting list.
    pub fn apply_update(&self, data: TextStreamData) {
        let mut entries = self.entries.lock();
        match resolve_index(&entries, &data) {
            Some(index) => entries[index] = data,
            None => entries.push(data),
        }
        // Published under the lock so observers see updates in apply order.
        self.transcriptions.set(Arc::new(entries.clone()));
    }

    pub fn transcriptions(&self) -> &Observable<Arc<Vec<TextStreamData>>> {
        &self.transcriptions
    }

    pub fn snapshot(&self) -> Arc<Vec<TextStreamData>> {
        self.transcriptions.get()
    }
}

impl Drop for TranscriptionAggregator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transcriptions.close();
    }
}

fn resolve_index(entries: &[TextStreamData], data: &TextStreamData) -> Option<usize> {
    entries.iter().position(|entry| entry.stream_info.id == data.stream_info.id).or_else(|| {
        let segment = segment_id(data)?;
        entries.iter().position(|entry| segment_id(entry) == Some(segment))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::TextStreamInfo;
    use std::collections::HashMap;

    fn data(stream_id: &str, segment: Option<&str>, text: &str) -> TextStreamData {
        let mut attributes = HashMap::new();
        if let Some(segment) = segment {
            attributes.insert(SEGMENT_ID_ATTRIBUTE.to_owned(), segment.to_owned());
        }
        TextStreamData {
            participant_identity: "agent".into(),
            stream_info: Arc::new(
                TextStreamInfo::new(stream_id, TRANSCRIPTION_TOPIC).with_attributes(attributes),
            ),
            text: text.to_owned(),
        }
    }

    fn texts(aggregator: &TranscriptionAggregator) -> Vec<String> {
        aggregator.snapshot().iter().map(|d| d.text.clone()).collect()
    }

    #[test]
    fn test_replaces_by_stream_id() {
        let aggregator = TranscriptionAggregator::new();
        aggregator.apply_update(data("s1", None, "hello"));
        aggregator.apply_update(data("s1", None, "hello world"));
        assert_eq!(texts(&aggregator), ["hello world"]);
    }

    #[test]
    fn test_segment_resumed_under_new_stream() {
        let aggregator = TranscriptionAggregator::new();
        aggregator.apply_update(data("s1", Some("seg"), "hel"));
        aggregator.apply_update(data("s2", None, "other"));
        aggregator.apply_update(data("s3", Some("seg"), "hello"));

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].stream_info.id, "s3");
        assert_eq!(snapshot[0].text, "hello");
        assert_eq!(snapshot[1].text, "other");
    }

    #[test]
    fn test_missing_segment_id_appends() {
        let aggregator = TranscriptionAggregator::new();
        aggregator.apply_update(data("s1", None, "a"));
        aggregator.apply_update(data("s2", None, "b"));
        assert_eq!(texts(&aggregator), ["a", "b"]);
    }

    #[test]
    fn test_attribute_helpers() {
        let mut d = data("s1", Some("seg"), "a");
        let mut info = (*d.stream_info).clone();
        info.attributes.insert(TRANSCRIPTION_FINAL_ATTRIBUTE.to_owned(), "true".to_owned());
        info.attributes.insert(TRANSCRIBED_TRACK_ID_ATTRIBUTE.to_owned(), "TR_mic".to_owned());
        d.stream_info = Arc::new(info);

        assert_eq!(segment_id(&d), Some("seg"));
        assert!(is_final(&d));
        assert_eq!(transcribed_track_id(&d), Some("TR_mic"));
        assert!(!is_final(&data("s2", None, "b")));
    }

    #[tokio::test]
    async fn test_every_update_is_published() {
        let aggregator = TranscriptionAggregator::new();
        let mut updates = aggregator.transcriptions().updates();
        assert!(updates.recv().await.unwrap().is_empty());

        aggregator.apply_update(data("s1", None, "a"));
        aggregator.apply_update(data("s1", None, "ab"));
        assert_eq!(updates.recv().await.unwrap()[0].text, "a");
        assert_eq!(updates.recv().await.unwrap()[0].text, "ab");
    }
}
