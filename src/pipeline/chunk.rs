//! Overlapping fixed-size windows over the linearized text.
//!
//! Offsets are counted in Unicode scalar values so that CJK text is split
//! on character boundaries, never inside a UTF-8 sequence.

use crate::error::CaseGenError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One window of the cleaned text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based position in the chunk list.
    pub index: usize,
    /// Character offset (inclusive) into the cleaned text.
    pub start: usize,
    /// Character offset (exclusive) into the cleaned text.
    pub end: usize,
    pub text: String,
}

/// Split `text` into windows of at most `chunk_size` characters, each
/// starting `chunk_size - overlap` characters after the previous one.
///
/// Characters in `strip_chars` are removed before splitting. Requires
/// `chunk_size >= 1` and `overlap < chunk_size`. The window stops once a
/// chunk reaches the end of the text, so the chunk count is
/// `ceil((len - overlap) / (chunk_size - overlap))` with a minimum of one.
pub fn chunk_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    strip_chars: &[char],
) -> Result<Vec<Chunk>, CaseGenError> {
    if chunk_size == 0 {
        return Err(CaseGenError::InvalidConfig(
            "chunk_size must be at least 1".into(),
        ));
    }
    if overlap >= chunk_size {
        return Err(CaseGenError::InvalidConfig(format!(
            "chunk_overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
        )));
    }

    let chars: Vec<char> = text.chars().filter(|c| !strip_chars.contains(c)).collect();
    let len = chars.len();
    let step = chunk_size - overlap;

    let mut chunks = Vec::with_capacity(len.div_ceil(step));
    let mut start = 0;
    while start < len {
        let end = (start + chunk_size).min(len);
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
            text: chars[start..end].iter().collect(),
        });
        if end == len {
            break;
        }
        start += step;
    }

    debug!(
        "Chunked {} chars into {} chunks (size={}, overlap={})",
        len,
        chunks.len(),
        chunk_size,
        overlap
    );
    Ok(chunks)
}

/// Rebuild the cleaned text from a chunk list: the non-overlapping prefix
/// of every chunk, then the last chunk whole.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for pair in chunks.windows(2) {
        let step = pair[1].start - pair[0].start;
        out.extend(pair[0].text.chars().take(step));
    }
    if let Some(last) = chunks.last() {
        out.push_str(&last.text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 10, 2, &[]).unwrap().is_empty());
    }

    #[test]
    fn text_made_only_of_strip_chars_yields_no_chunks() {
        assert!(chunk_text("◦◦··", 10, 2, &['◦', '·']).unwrap().is_empty());
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = chunk_text("abc", 5, 5, &[]).unwrap_err();
        assert!(matches!(err, CaseGenError::InvalidConfig(_)));
        let err = chunk_text("abc", 0, 0, &[]).unwrap_err();
        assert!(matches!(err, CaseGenError::InvalidConfig(_)));
    }

    #[test]
    fn default_window_over_2500_chars() {
        let text: String = "x".repeat(2500);
        let chunks = chunk_text(&text, 1000, 200, &[]).unwrap();
        let spans: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(spans, vec![(0, 1000), (800, 1800), (1600, 2500)]);
        let lens: Vec<usize> = chunks.iter().map(|c| c.text.chars().count()).collect();
        assert_eq!(lens, vec![1000, 1000, 900]);
    }

    #[test]
    fn consecutive_chunks_share_exactly_overlap_chars() {
        let text: String = (0..137).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_text(&text, 20, 7, &[]).unwrap();
        assert_eq!(chunks.len(), (137 - 7usize).div_ceil(13));
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert_eq!(a.end - b.start, 7);
            let tail: String = a.text.chars().skip(20 - 7).collect();
            let head: String = b.text.chars().take(7).collect();
            assert_eq!(tail, head);
        }
        for c in &chunks {
            assert!(c.end - c.start <= 20);
        }
    }

    #[test]
    fn chunks_reconstruct_the_cleaned_text() {
        let text = "需求说明·第一章◦ 登录功能：用户输入账号密码后点击登录按钮。".repeat(9);
        let chunks = chunk_text(&text, 31, 9, &['◦', '·']).unwrap();
        let cleaned: String = text.chars().filter(|c| *c != '◦' && *c != '·').collect();
        assert_eq!(reassemble(&chunks), cleaned);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let chunks = chunk_text("测试用例生成", 4, 1, &[]).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["测试用例", "例生成"]);
    }

    #[test]
    fn text_shorter_than_overlap_is_one_chunk() {
        let chunks = chunk_text("ab", 10, 5, &[]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "ab");
    }

    #[test]
    fn zero_overlap_partitions_text() {
        let chunks = chunk_text("abcdefg", 3, 0, &[]).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abc", "def", "g"]);
    }
}
