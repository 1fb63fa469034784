//! Chunk splitter: cuts rendered text into message-sized pieces at line ends.
//!
//! Lines keep their `\n` terminator, so every chunk ends right after a line
//! break and plain concatenation of the chunks gives back the input.
//! Lengths are counted in characters, matching the chat platform's limit.

use std::num::NonZeroUsize;

/// A line that was longer than the limit and went out as its own chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OversizedLine {
    /// Zero-based line number in the rendered text.
    pub line_index: usize,
    pub length: usize,
}

/// One message of a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub destination_key: String,
    pub sequence_index: usize,
    pub text: String,
}

/// Output of [`split`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Split {
    pub chunks: Vec<String>,
    pub oversized: Vec<OversizedLine>,
}

impl Split {
    pub fn into_chunks(self, destination_key: &str) -> Vec<Chunk> {
        self.chunks
            .into_iter()
            .enumerate()
            .map(|(sequence_index, text)| Chunk {
                destination_key: destination_key.to_string(),
                sequence_index,
                text,
            })
            .collect()
    }
}

/// Greedily packs whole lines into chunks of at most `max_size` characters.
///
/// A line that alone exceeds `max_size` is emitted as a chunk of its own and
/// listed in [`Split::oversized`]; it is never truncated. Empty text gives no
/// chunks. Deterministic for identical input.
pub fn split(text: &str, max_size: NonZeroUsize) -> Split {
    let max_size = max_size.get();
    let mut result = Split::default();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;

    for (line_index, line) in text.split_inclusive('\n').enumerate() {
        let length = line.chars().count();

        if length > max_size {
            if !buffer.is_empty() {
                result.chunks.push(std::mem::take(&mut buffer));
                buffer_len = 0;
            }
            result.chunks.push(line.to_string());
            result.oversized.push(OversizedLine { line_index, length });
            continue;
        }

        if buffer_len + length > max_size {
            result.chunks.push(std::mem::take(&mut buffer));
            buffer_len = 0;
        }
        buffer.push_str(line);
        buffer_len += length;
    }

    if !buffer.is_empty() {
        result.chunks.push(buffer);
    }
    result
}

/// Joins chunks back into the text they were split from.
pub fn reassemble<S: AsRef<str>>(chunks: &[S]) -> String {
    chunks.iter().map(|chunk| chunk.as_ref()).collect()
}
