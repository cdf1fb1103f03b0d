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

use std::collections::HashMap;

pub(crate) mod dispatcher;
pub(crate) mod utf8_chunk;

/// Returns the attributes whose value differs between `old_attributes` and
/// `new_attributes`. Removed keys map to an empty string.
pub(crate) fn calculate_changed_attributes(
    old_attributes: &HashMap<String, String>,
    new_attributes: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut changed = HashMap::new();
    for key in old_attributes.keys().chain(new_attributes.keys()) {
        let new_value = new_attributes.get(key);
        if old_attributes.get(key) != new_value {
            changed.insert(key.clone(), new_value.cloned().unwrap_or_default());
        }
    }
    changed
}
