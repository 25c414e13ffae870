//! Document model shared by every linearization stage.
//!
//! A [`DocumentSource`] is resolved once at ingestion: either a *flow*
//! document (Word: an ordered sequence of paragraphs and tables whose runs
//! carry inline image anchors) or a *paged* document (PDF layout: positioned
//! characters and images per page). Downstream stages match on the variant
//! instead of sniffing file extensions again.
//!
//! Both variants deserialize from a JSON layout file, so any external
//! extractor can feed the pipeline:
//!
//! ```json
//! { "format": "paged",
//!   "pages": [ { "chars": [ { "text": "A", "x0": 10.0, "y0": 700.0 } ],
//!                "images": [ { "x0": 10.0, "y0": 500.0, "x1": 200.0, "y1": 650.0 } ] } ] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document resolved to one of the two traversal shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum DocumentSource {
    /// Block-oriented source (DOCX).
    Flow(FlowDocument),
    /// Page-oriented source (PDF layout).
    Paged(PagedDocument),
}

impl DocumentSource {
    /// Short label used in logs and status text.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentSource::Flow(_) => "flow",
            DocumentSource::Paged(_) => "paged",
        }
    }

    /// Raw bytes of the image an anchor points at, if the source carries them.
    pub fn image_bytes(&self, anchor: &ImageAnchor) -> Option<&[u8]> {
        match (self, &anchor.path) {
            (DocumentSource::Flow(doc), _) => {
                let rel_id = anchor.fingerprint.as_deref()?;
                doc.media.get(rel_id).map(Vec::as_slice)
            }
            (DocumentSource::Paged(doc), AnchorPath::Page { page, index }) => doc
                .pages
                .get(*page)
                .and_then(|p| p.images.get(*index))
                .map(|img| img.data.as_slice())
                .filter(|d| !d.is_empty()),
            _ => None,
        }
    }
}

// ── Flow documents ───────────────────────────────────────────────────────

/// A block-oriented document: body blocks plus media parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDocument {
    pub blocks: Vec<Block>,
    /// Image parts keyed by relationship id. An inline image whose
    /// relationship id is not present here is unresolvable and gets dropped.
    #[serde(default)]
    pub media: BTreeMap<String, Vec<u8>>,
}

/// One top-level body block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    Paragraph(Paragraph),
    Table(Table),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paragraph {
    /// Style id (`Heading1`, `TOC2`, `标题 1`…), used by section filtering.
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl Paragraph {
    /// Plain text of all runs, images ignored.
    pub fn text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }
}

/// A run of text with zero or more inline images anchored after its text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Run {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<InlineImage>,
}

/// An inline image reference inside a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InlineImage {
    /// Relationship id (`r:embed`). `None` when the drawing XML was malformed.
    #[serde(default)]
    pub rel_id: Option<String>,
}

/// A table: rows → cells → paragraphs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    #[serde(default)]
    pub paragraphs: Vec<Paragraph>,
}

// ── Paged documents ──────────────────────────────────────────────────────

/// A page-oriented document in PDF user-space coordinates (origin bottom-left,
/// so larger `y0` is higher on the page).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PagedDocument {
    pub pages: Vec<Page>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub chars: Vec<PositionedChar>,
    #[serde(default)]
    pub images: Vec<PageImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionedChar {
    pub text: String,
    pub x0: f64,
    pub y0: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageImage {
    pub x0: f64,
    pub y0: f64,
    #[serde(default)]
    pub x1: f64,
    #[serde(default)]
    pub y1: f64,
    /// Encoded image bytes, when the extractor exported them.
    #[serde(default)]
    pub data: Vec<u8>,
}

// ── Anchors ──────────────────────────────────────────────────────────────

/// Where an anchor lives in the structural tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnchorPath {
    /// Top-level paragraph at `block`.
    Paragraph { block: usize },
    /// Paragraph inside the table at `block`.
    TableCell {
        block: usize,
        row: usize,
        column: usize,
        paragraph: usize,
    },
    /// The `index`-th image object on page `page` (0-based).
    Page { page: usize, index: usize },
}

/// Position metadata for anchors in paged documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PagePosition {
    /// 1-based page number.
    pub page: usize,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// Stable key of one anchor occurrence within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorKey {
    pub path: AnchorPath,
    pub run_index: usize,
    pub occurrence_index: usize,
}

/// One embedded image occurrence, discovered during a single traversal pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnchor {
    pub path: AnchorPath,
    pub run_index: usize,
    pub occurrence_index: usize,
    pub position: Option<PagePosition>,
    /// Relationship id (flow) or md5 of the image bytes (paged).
    pub fingerprint: Option<String>,
    /// Discovery sequence number; the final tie-breaker in ordering.
    pub discovery: usize,
}

impl ImageAnchor {
    pub fn key(&self) -> AnchorKey {
        AnchorKey {
            path: self.path,
            run_index: self.run_index,
            occurrence_index: self.occurrence_index,
        }
    }

    /// Human-readable id for status text, e.g. `para_3_run_2`.
    pub fn label(&self) -> String {
        match self.path {
            AnchorPath::Paragraph { block } => {
                format!("para_{}_run_{}", block + 1, self.run_index + 1)
            }
            AnchorPath::TableCell {
                block, row, column, ..
            } => format!("table_{}_r{}c{}", block + 1, row + 1, column + 1),
            AnchorPath::Page { page, index } => format!("page_{}_img_{}", page + 1, index + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paged_layout_deserializes_from_tagged_json() {
        let json = r#"{
            "format": "paged",
            "pages": [ { "chars": [ { "text": "A", "x0": 1.0, "y0": 2.0 } ],
                         "images": [ { "x0": 3.0, "y0": 4.0 } ] } ]
        }"#;
        let src: DocumentSource = serde_json::from_str(json).unwrap();
        match src {
            DocumentSource::Paged(doc) => {
                assert_eq!(doc.pages.len(), 1);
                assert_eq!(doc.pages[0].chars[0].text, "A");
                assert!(doc.pages[0].images[0].data.is_empty());
            }
            other => panic!("expected paged, got {}", other.kind()),
        }
    }

    #[test]
    fn flow_layout_deserializes_blocks_in_order() {
        let json = r#"{
            "format": "flow",
            "blocks": [
                { "kind": "paragraph", "runs": [ { "text": "P1" } ] },
                { "kind": "table", "rows": [ [ { "paragraphs": [] } ] ] }
            ],
            "media": { "rId1": [137, 80] }
        }"#;
        let src: DocumentSource = serde_json::from_str(json).unwrap();
        let DocumentSource::Flow(doc) = src else {
            panic!("expected flow");
        };
        assert!(matches!(doc.blocks[0], Block::Paragraph(_)));
        assert!(matches!(doc.blocks[1], Block::Table(_)));
        assert_eq!(doc.media["rId1"], vec![137, 80]);
    }

    #[test]
    fn anchor_label_formats() {
        let anchor = ImageAnchor {
            path: AnchorPath::Page { page: 1, index: 0 },
            run_index: 0,
            occurrence_index: 0,
            position: None,
            fingerprint: None,
            discovery: 0,
        };
        assert_eq!(anchor.label(), "page_2_img_1");
    }
}
