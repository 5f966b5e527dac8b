//! Payload chunking policy.
//!
//! Pieces are measured in characters and always fall on character
//! boundaries; concatenating the yielded pieces reproduces the input
//! exactly.

/// Ceiling for one binary piece, in characters.
pub const MAX_CHUNK_SIZE: usize = 102_400;

/// Target size for one structured-text piece, in characters.
pub const MAX_TEXT_CHUNK_SIZE: usize = 1_000;

/// Smallest piece the splitter will aim for.
const MIN_CHUNK_FLOOR: usize = 40;

const PLAIN_TEXT_SUFFIXES: &[&str] = &[
    ".md", ".txt", ".json", ".xml", ".html", ".css", ".js", ".ts", ".svg", ".csv", ".yaml", ".yml",
];

/// Piece-size ceilings, injectable for tests.
#[derive(Clone, Copy, Debug)]
pub struct ChunkPolicy {
    pub text_size: usize,
    pub binary_size: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            text_size: MAX_TEXT_CHUNK_SIZE,
            binary_size: MAX_CHUNK_SIZE,
        }
    }
}

/// Whether an id names structured text that should split at semantic
/// boundaries.
pub fn is_plain_text(id: &str) -> bool {
    let lower = id.to_ascii_lowercase();
    PLAIN_TEXT_SUFFIXES
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

fn piece_size(
    payload_chars: usize,
    policy: &ChunkPolicy,
    custom_chunk_size: usize,
    plain: bool,
    save_as_big_chunk: bool,
) -> usize {
    if plain && !save_as_big_chunk {
        return policy.text_size.max(1);
    }
    let ceiling = policy.binary_size.max(MIN_CHUNK_FLOOR);
    let minimum = (payload_chars / 100).clamp(MIN_CHUNK_FLOOR, ceiling);
    policy
        .binary_size
        .saturating_mul(custom_chunk_size)
        .max(minimum)
}

/// Lazily divide `payload` into non-empty pieces.
pub fn split_pieces<'a>(
    payload: &'a str,
    policy: &ChunkPolicy,
    custom_chunk_size: usize,
    plain: bool,
    save_as_big_chunk: bool,
) -> Pieces<'a> {
    let chars = payload.chars().count();
    Pieces {
        rest: payload,
        piece_chars: piece_size(chars, policy, custom_chunk_size, plain, save_as_big_chunk),
        plain: plain && !save_as_big_chunk,
    }
}

pub struct Pieces<'a> {
    rest: &'a str,
    piece_chars: usize,
    plain: bool,
}

impl<'a> Iterator for Pieces<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let window_end = byte_index_of_char(self.rest, self.piece_chars);
        let cut = if self.plain && window_end < self.rest.len() {
            let window = &self.rest[..window_end];
            window
                .rfind("\n\n")
                .map(|pos| pos + 2)
                .or_else(|| window.rfind('\n').map(|pos| pos + 1))
                .unwrap_or(window_end)
        } else {
            window_end
        };
        let (piece, rest) = self.rest.split_at(cut);
        self.rest = rest;
        Some(piece)
    }
}

fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(idx, _)| idx).unwrap_or(s.len())
}
