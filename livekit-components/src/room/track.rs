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

use crate::id::ParticipantIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Unknown,
    Camera,
    Microphone,
    Screenshare,
    ScreenshareAudio,
}

/// Identifies a track of a participant, by source, by name, or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackReference {
    pub participant_identity: ParticipantIdentity,
    pub source: Option<TrackSource>,
    pub name: Option<String>,
}

impl TrackReference {
    /// # Panics
    ///
    /// Panics when neither `source` nor `name` is given.
    pub fn new(
        participant_identity: ParticipantIdentity,
        source: Option<TrackSource>,
        name: Option<String>,
    ) -> Self {
        assert!(source.is_some() || name.is_some(), "no source or name given");
        Self { participant_identity, source, name }
    }

    pub fn from_source(participant_identity: ParticipantIdentity, source: TrackSource) -> Self {
        Self::new(participant_identity, Some(source), None)
    }

    /// Whether this reference designates `other`. A missing source or name
    /// on either side matches anything.
    pub fn matches(&self, other: &TrackReference) -> bool {
        fn field_matches<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.participant_identity == other.participant_identity
            && field_matches(&self.source, &other.source)
            && field_matches(&self.name, &other.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "no source or name given")]
    fn test_requires_source_or_name() {
        let _ = TrackReference::new("p".into(), None, None);
    }

    #[test]
    fn test_matches() {
        let by_source = TrackReference::from_source("p".into(), TrackSource::Microphone);
        let by_both = TrackReference::new(
            "p".into(),
            Some(TrackSource::Microphone),
            Some("mic".to_owned()),
        );
        let other = TrackReference::from_source("p".into(), TrackSource::Camera);
        assert!(by_source.matches(&by_both));
        assert!(!by_source.matches(&other));
        assert!(!by_source
            .matches(&TrackReference::from_source("q".into(), TrackSource::Microphone)));
    }
}
