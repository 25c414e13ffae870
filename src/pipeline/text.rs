//! Plain-text and Markdown reader: bytes → [`FlowDocument`].
//!
//! Decoding tries UTF-8 (BOM stripped), then GBK, which also covers GB2312,
//! then Windows-1252 as a last resort that never fails. Every non-blank line
//! becomes one paragraph. Markdown ATX headings (`# 登录`) get a
//! `heading N` style so section filtering treats them like Word headings;
//! their text is kept verbatim.

use crate::document::{Block, FlowDocument, Paragraph, Run};
use encoding_rs::{Encoding, GBK, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use tracing::debug;

/// Decode `bytes` with the first encoding that accepts them.
pub fn decode_text(bytes: &[u8]) -> (Cow<'_, str>, &'static Encoding) {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    for encoding in [UTF_8, GBK] {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(body) {
            return (text, encoding);
        }
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(body);
    (text, WINDOWS_1252)
}

/// Build a flow document with one paragraph per non-blank line.
pub fn read_text(bytes: &[u8]) -> FlowDocument {
    let (text, encoding) = decode_text(bytes);
    debug!("Decoded text input as {}", encoding.name());

    let blocks: Vec<Block> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            Block::Paragraph(Paragraph {
                style: markdown_heading_level(line).map(|n| format!("heading {n}")),
                runs: vec![Run {
                    text: line.to_string(),
                    images: Vec::new(),
                }],
            })
        })
        .collect();

    FlowDocument {
        blocks,
        media: Default::default(),
    }
}

fn markdown_heading_level(line: &str) -> Option<usize> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    let rest = &line[hashes..];
    ((1..=6).contains(&hashes) && (rest.is_empty() || rest.starts_with([' ', '\t']))).then_some(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(doc: &FlowDocument) -> Vec<(Option<String>, String)> {
        doc.blocks
            .iter()
            .map(|b| match b {
                Block::Paragraph(p) => (p.style.clone(), p.text()),
                Block::Table(_) => panic!("text input never yields tables"),
            })
            .collect()
    }

    #[test]
    fn utf8_with_bom_and_crlf() {
        let doc = read_text("\u{feff}登录功能\r\n\r\n密码错误提示\r\n".as_bytes());
        assert_eq!(
            texts(&doc),
            vec![
                (None, "登录功能".to_string()),
                (None, "密码错误提示".to_string())
            ]
        );
    }

    #[test]
    fn gbk_bytes_fall_back_from_utf8() {
        let (encoded, _, _) = GBK.encode("用户名长度为6到20个字符");
        let (text, encoding) = decode_text(&encoded);
        assert_eq!(encoding, GBK);
        assert_eq!(text, "用户名长度为6到20个字符");
    }

    #[test]
    fn undecodable_bytes_still_produce_text() {
        // 0xFF is invalid as a lead byte in both UTF-8 and GBK.
        let (text, encoding) = decode_text(b"caf\xe9 \xff");
        assert_eq!(encoding, WINDOWS_1252);
        assert_eq!(text, "café ÿ");
    }

    #[test]
    fn markdown_headings_get_heading_styles() {
        let doc = read_text("# 1 登录\n正文\n### 细节\n#标签\n####### 太深\n".as_bytes());
        let styles: Vec<Option<String>> = texts(&doc).into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            styles,
            vec![
                Some("heading 1".to_string()),
                None,
                Some("heading 3".to_string()),
                None,
                None
            ]
        );
        assert_eq!(texts(&doc)[0].1, "# 1 登录");
    }
}
