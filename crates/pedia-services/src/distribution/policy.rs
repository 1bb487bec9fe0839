//! Deterministic sharing policy: file categories, chunk sizing and chunk
//! priorities.

use std::path::Path;

use pedia_core::wire::MAX_CHUNK_PAYLOAD;
use serde::Serialize;

pub const MIN_CHUNK_SIZE: usize = 16 * 1024;
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

const SMALL_FILE: u64 = 1024 * 1024;
const LARGE_FILE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Code,
    Archive,
    Unknown,
}

impl Category {
    /// Classify by extension, falling back to the MIME top-level type.
    pub fn of(name: &str, mime: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let by_ext = match ext.as_deref() {
            Some("txt" | "md" | "rtf") => Some(Category::Text),
            Some("jpg" | "jpeg" | "png" | "gif" | "svg" | "webp") => Some(Category::Image),
            Some("mp4" | "avi" | "mov" | "mkv" | "webm") => Some(Category::Video),
            Some("mp3" | "wav" | "flac" | "ogg") => Some(Category::Audio),
            Some("pdf" | "doc" | "docx" | "odt") => Some(Category::Document),
            Some("js" | "ts" | "py" | "java" | "rs" | "go" | "c" | "h") => Some(Category::Code),
            Some("zip" | "tar" | "gz" | "xz" | "7z") => Some(Category::Archive),
            _ => None,
        };
        by_ext.unwrap_or_else(|| match mime.split('/').next() {
            Some("text") => Category::Text,
            Some("image") => Category::Image,
            Some("video") => Category::Video,
            Some("audio") => Category::Audio,
            _ => Category::Unknown,
        })
    }

    /// Scale applied to the base chunk size.
    pub fn multiplier(self) -> f64 {
        match self {
            Category::Text => 0.5,
            Category::Code => 0.75,
            Category::Image | Category::Archive => 1.5,
            Category::Video => 2.0,
            Category::Audio | Category::Document | Category::Unknown => 1.0,
        }
    }

    fn is_media(self) -> bool {
        matches!(self, Category::Video | Category::Audio)
    }
}

/// Guess a MIME type from the file name.
pub fn mime_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub trait ChunkSizePolicy: Send + Sync {
    fn chunk_size(&self, base: usize, file_size: u64, category: Category) -> usize;
}

/// The configured base size, bounded by what one bulk frame can carry.
pub struct FixedChunkSize;

impl ChunkSizePolicy for FixedChunkSize {
    fn chunk_size(&self, base: usize, _file_size: u64, _category: Category) -> usize {
        base.clamp(1, MAX_CHUNK_PAYLOAD)
    }
}

/// Category multiplier, then small files capped and large files raised,
/// all clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
pub struct AdaptiveChunkSize;

impl ChunkSizePolicy for AdaptiveChunkSize {
    fn chunk_size(&self, base: usize, file_size: u64, category: Category) -> usize {
        let mut size = (base as f64 * category.multiplier()) as usize;
        if file_size < SMALL_FILE {
            size = size.min(MIN_CHUNK_SIZE);
        } else if file_size > LARGE_FILE {
            size = size.max(MAX_CHUNK_SIZE);
        }
        size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}

/// Fetch priority for a chunk. Media containers keep headers at the front
/// and often an index at the back, so players need both ends first.
pub fn chunk_priority(index: usize, total: usize, category: Category) -> u8 {
    if !category.is_media() || total < 3 {
        return 0;
    }
    if index == 0 {
        2
    } else if index + 1 == total {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_by_extension_and_mime() {
        assert_eq!(Category::of("notes.MD", "text/markdown"), Category::Text);
        assert_eq!(Category::of("clip.mp4", "video/mp4"), Category::Video);
        assert_eq!(Category::of("main.rs", "text/x-rust"), Category::Code);
        assert_eq!(Category::of("noext", "image/png"), Category::Image);
        assert_eq!(Category::of("blob.bin", "application/octet-stream"), Category::Unknown);
    }

    #[test]
    fn mime_guess_falls_back_to_octet_stream() {
        assert_eq!(mime_for("a.png"), "image/png");
        assert_eq!(mime_for("a.unknownext"), "application/octet-stream");
    }

    #[test]
    fn adaptive_sizes_stay_in_range() {
        let policy = AdaptiveChunkSize;
        let base = 64 * 1024;
        // Small files get the minimum regardless of category.
        assert_eq!(policy.chunk_size(base, 10_000, Category::Video), MIN_CHUNK_SIZE);
        // Mid-size text halves the base.
        assert_eq!(policy.chunk_size(base, 5 * 1024 * 1024, Category::Text), 32 * 1024);
        // Mid-size video doubles it.
        assert_eq!(policy.chunk_size(base, 5 * 1024 * 1024, Category::Video), 128 * 1024);
        // Large files are raised to the maximum.
        assert_eq!(policy.chunk_size(base, 200 * 1024 * 1024, Category::Text), MAX_CHUNK_SIZE);
        // Huge bases are clamped.
        assert_eq!(
            policy.chunk_size(1024 * 1024, 5 * 1024 * 1024, Category::Video),
            MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn fixed_size_ignores_category() {
        assert_eq!(FixedChunkSize.chunk_size(65536, 1, Category::Video), 65536);
    }

    #[test]
    fn fixed_size_never_exceeds_one_frame() {
        let two_mib = 2 * 1024 * 1024;
        assert_eq!(FixedChunkSize.chunk_size(two_mib, 8 * two_mib as u64, Category::Text), MAX_CHUNK_PAYLOAD);
        assert_eq!(FixedChunkSize.chunk_size(0, 10, Category::Text), 1);
    }

    #[test]
    fn media_ends_are_prioritized() {
        assert_eq!(chunk_priority(0, 10, Category::Video), 2);
        assert_eq!(chunk_priority(9, 10, Category::Video), 1);
        assert_eq!(chunk_priority(4, 10, Category::Video), 0);
        assert_eq!(chunk_priority(0, 10, Category::Text), 0);
    }
}
