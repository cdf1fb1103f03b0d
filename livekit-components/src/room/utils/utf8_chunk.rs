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

/// Iterator over byte chunks of at most `chunk_size` bytes that never split a
/// UTF-8 encoded character.
pub struct Utf8AwareChunks<'a> {
    bytes: &'a [u8],
    chunk_size: usize,
}

impl<'a> Utf8AwareChunks<'a> {
    fn new(bytes: &'a [u8], chunk_size: usize) -> Self {
        assert!(chunk_size >= 4, "chunk_size must be at least 4 due to utf8 encoding rules");
        Utf8AwareChunks { bytes, chunk_size }
    }
}

impl<'a> Iterator for Utf8AwareChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }

        if self.bytes.len() <= self.chunk_size {
            let chunk = self.bytes;
            self.bytes = &[];
            return Some(chunk);
        }

        // Walk back from the cut point past continuation bytes (0b10xxxxxx).
        let mut k = self.chunk_size;
        while k > 0 && (self.bytes[k] & 0xc0) == 0x80 {
            k -= 1;
        }

        let (chunk, rest) = self.bytes.split_at(k);
        self.bytes = rest;
        Some(chunk)
    }
}

pub trait Utf8AwareChunkExt {
    /// Splits the bytes into chunks of the specified size, ensuring that
    /// UTF-8 character boundaries are respected.
    fn utf8_aware_chunks(&self, chunk_size: usize) -> Utf8AwareChunks<'_>;
}

impl Utf8AwareChunkExt for [u8] {
    fn utf8_aware_chunks(&self, chunk_size: usize) -> Utf8AwareChunks<'_> {
        Utf8AwareChunks::new(self, chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_chunking() {
        let chunks: Vec<&[u8]> = "Hello, World!".as_bytes().utf8_aware_chunks(5).collect();
        assert_eq!(chunks, [&b"Hello"[..], &b", Wor"[..], &b"ld!"[..]]);
    }

    #[test]
    fn test_multibyte_boundary() {
        let text = "ab👋cd";
        let chunks: Vec<&[u8]> = text.as_bytes().utf8_aware_chunks(4).collect();
        assert_eq!(chunks, [&b"ab"[..], "👋".as_bytes(), &b"cd"[..]]);
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(std::str::from_utf8(&joined).unwrap(), text);
    }

    #[test]
    fn test_empty() {
        assert_eq!("".as_bytes().utf8_aware_chunks(8).count(), 0);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be at least 4")]
    fn test_chunk_size_too_small() {
        let _ = "abc".as_bytes().utf8_aware_chunks(3);
    }
}
