//! Canonical reading order of embedded images.
//!
//! Anchors are discovered in one traversal pass and sorted once. The result
//! is the single source of truth for which replacement belongs to which
//! image: vision analysis walks [`GlobalImageOrder::images`] and the
//! linearizer resolves every anchor it meets through
//! [`GlobalImageOrder::slot_of`].

use crate::document::{
    AnchorKey, AnchorPath, Block, DocumentSource, FlowDocument, ImageAnchor, PagePosition,
    PagedDocument, Paragraph,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// How repeated references to the same image are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Every anchor gets its own slot and its own replacement.
    #[default]
    None,
    /// Anchors whose fingerprint was already seen reuse the first slot.
    ByFingerprint,
}

/// Ordered unique images plus the anchor-to-slot lookup.
#[derive(Debug, Clone, Default)]
pub struct GlobalImageOrder {
    images: Vec<ImageAnchor>,
    slots: HashMap<AnchorKey, usize>,
    anchors: usize,
    dropped: usize,
}

impl GlobalImageOrder {
    /// Discover, validate, sort and deduplicate the anchors of `source`.
    pub fn resolve(source: &DocumentSource, dedup: DedupPolicy) -> Self {
        let (mut found, dropped) = match source {
            DocumentSource::Flow(doc) => discover_flow(doc),
            DocumentSource::Paged(doc) => discover_paged(doc),
        };

        if let DocumentSource::Paged(_) = source {
            // Stable: equal keys keep discovery order.
            found.sort_by(|a, b| {
                let (pa, pb) = (a.position, b.position);
                let page = |p: Option<PagePosition>| p.map_or(0, |p| p.page);
                let y = |p: Option<PagePosition>| p.map_or(0.0, |p| p.y0);
                let x = |p: Option<PagePosition>| p.map_or(0.0, |p| p.x0);
                page(pa)
                    .cmp(&page(pb))
                    .then_with(|| y(pb).total_cmp(&y(pa)))
                    .then_with(|| x(pa).total_cmp(&x(pb)))
            });
        }

        let anchors = found.len();
        let mut images: Vec<ImageAnchor> = Vec::new();
        let mut slots = HashMap::with_capacity(anchors);
        let mut first_by_fingerprint: HashMap<String, usize> = HashMap::new();

        for anchor in found {
            if dedup == DedupPolicy::ByFingerprint {
                if let Some(fp) = anchor.fingerprint.as_ref() {
                    if let Some(&slot) = first_by_fingerprint.get(fp) {
                        debug!(
                            "Image {} repeats slot {} (fingerprint {})",
                            anchor.label(),
                            slot,
                            fp
                        );
                        slots.insert(anchor.key(), slot);
                        continue;
                    }
                    first_by_fingerprint.insert(fp.clone(), images.len());
                }
            }
            slots.insert(anchor.key(), images.len());
            images.push(anchor);
        }

        debug!(
            "Resolved {} image anchors into {} slots ({} dropped, {} document)",
            anchors,
            images.len(),
            dropped,
            source.kind()
        );

        Self {
            images,
            slots,
            anchors,
            dropped,
        }
    }

    /// Unique images in reading order; one replacement per entry.
    pub fn images(&self) -> &[ImageAnchor] {
        &self.images
    }

    /// Number of replacement slots.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Valid anchors seen, duplicates included.
    pub fn anchor_count(&self) -> usize {
        self.anchors
    }

    /// Anchors discarded because they could not be resolved.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Replacement slot of an anchor occurrence, `None` for dropped anchors.
    pub fn slot_of(&self, key: &AnchorKey) -> Option<usize> {
        self.slots.get(key).copied()
    }
}

// ── Discovery ────────────────────────────────────────────────────────────

fn discover_flow(doc: &FlowDocument) -> (Vec<ImageAnchor>, usize) {
    let mut found = Vec::new();
    let mut dropped = 0;

    for (block_idx, block) in doc.blocks.iter().enumerate() {
        match block {
            Block::Paragraph(p) => collect_paragraph(
                doc,
                p,
                AnchorPath::Paragraph { block: block_idx },
                &mut found,
                &mut dropped,
            ),
            Block::Table(t) => {
                for (row, cells) in t.rows.iter().enumerate() {
                    for (column, cell) in cells.iter().enumerate() {
                        for (paragraph, p) in cell.paragraphs.iter().enumerate() {
                            let path = AnchorPath::TableCell {
                                block: block_idx,
                                row,
                                column,
                                paragraph,
                            };
                            collect_paragraph(doc, p, path, &mut found, &mut dropped);
                        }
                    }
                }
            }
        }
    }
    (found, dropped)
}

fn collect_paragraph(
    doc: &FlowDocument,
    paragraph: &Paragraph,
    path: AnchorPath,
    found: &mut Vec<ImageAnchor>,
    dropped: &mut usize,
) {
    for (run_index, run) in paragraph.runs.iter().enumerate() {
        for (occurrence_index, image) in run.images.iter().enumerate() {
            let resolved = image
                .rel_id
                .as_ref()
                .filter(|id| doc.media.contains_key(id.as_str()));
            let Some(rel_id) = resolved else {
                warn!(
                    "Skipping image at {:?} run {} #{}: relationship id {:?} not resolvable",
                    path, run_index, occurrence_index, image.rel_id
                );
                *dropped += 1;
                continue;
            };
            found.push(ImageAnchor {
                path,
                run_index,
                occurrence_index,
                position: None,
                fingerprint: Some(rel_id.clone()),
                discovery: found.len(),
            });
        }
    }
}

fn discover_paged(doc: &PagedDocument) -> (Vec<ImageAnchor>, usize) {
    let mut found = Vec::new();
    let mut dropped = 0;

    for (page_idx, page) in doc.pages.iter().enumerate() {
        for (index, img) in page.images.iter().enumerate() {
            if !img.x0.is_finite() || !img.y0.is_finite() {
                warn!(
                    "Skipping image {} on page {}: geometry not resolvable",
                    index + 1,
                    page_idx + 1
                );
                dropped += 1;
                continue;
            }
            let fingerprint =
                (!img.data.is_empty()).then(|| format!("{:x}", md5::compute(&img.data)));
            found.push(ImageAnchor {
                path: AnchorPath::Page {
                    page: page_idx,
                    index,
                },
                run_index: 0,
                occurrence_index: 0,
                position: Some(PagePosition {
                    page: page_idx + 1,
                    x0: img.x0,
                    y0: img.y0,
                    x1: img.x1,
                    y1: img.y1,
                }),
                fingerprint,
                discovery: found.len(),
            });
        }
    }
    (found, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Cell, InlineImage, Page, PageImage, Run, Table};
    use std::collections::BTreeMap;

    fn image_run(text: &str, rel_ids: &[&str]) -> Run {
        Run {
            text: text.into(),
            images: rel_ids
                .iter()
                .map(|id| InlineImage {
                    rel_id: Some(id.to_string()),
                })
                .collect(),
        }
    }

    fn para(runs: Vec<Run>) -> Block {
        Block::Paragraph(Paragraph { style: None, runs })
    }

    fn media(ids: &[&str]) -> BTreeMap<String, Vec<u8>> {
        ids.iter().map(|id| (id.to_string(), vec![1, 2, 3])).collect()
    }

    fn page_image(x0: f64, y0: f64, data: &[u8]) -> PageImage {
        PageImage {
            x0,
            y0,
            x1: x0 + 10.0,
            y1: y0 + 10.0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn flow_order_visits_tables_at_their_block_position() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                para(vec![image_run("a", &["rA"])]),
                Block::Table(Table {
                    rows: vec![vec![Cell {
                        paragraphs: vec![Paragraph {
                            style: None,
                            runs: vec![image_run("", &["rB"])],
                        }],
                    }]],
                }),
                para(vec![image_run("c", &["rC"])]),
            ],
            media: media(&["rA", "rB", "rC"]),
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::ByFingerprint);
        let fps: Vec<&str> = order
            .images()
            .iter()
            .filter_map(|a| a.fingerprint.as_deref())
            .collect();
        assert_eq!(fps, vec!["rA", "rB", "rC"]);
    }

    #[test]
    fn flow_orders_by_run_then_occurrence() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![para(vec![
                image_run("x", &["r1", "r2"]),
                image_run("y", &["r3"]),
            ])],
            media: media(&["r1", "r2", "r3"]),
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::None);
        let keys: Vec<(usize, usize)> = order
            .images()
            .iter()
            .map(|a| (a.run_index, a.occurrence_index))
            .collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn unresolvable_relationships_are_dropped() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![para(vec![
                image_run("", &["missing"]),
                Run {
                    text: String::new(),
                    images: vec![InlineImage { rel_id: None }],
                },
                image_run("", &["ok"]),
            ])],
            media: media(&["ok"]),
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::ByFingerprint);
        assert_eq!(order.len(), 1);
        assert_eq!(order.dropped(), 2);
        let ok = AnchorKey {
            path: AnchorPath::Paragraph { block: 0 },
            run_index: 2,
            occurrence_index: 0,
        };
        assert_eq!(order.slot_of(&ok), Some(0));
    }

    #[test]
    fn duplicate_fingerprint_shares_first_slot() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                para(vec![image_run("", &["r1"])]),
                para(vec![image_run("", &["r2"])]),
                para(vec![image_run("", &["r1"])]),
            ],
            media: media(&["r1", "r2"]),
        });
        let dedup = GlobalImageOrder::resolve(&doc, DedupPolicy::ByFingerprint);
        assert_eq!(dedup.len(), 2);
        assert_eq!(dedup.anchor_count(), 3);
        let third = AnchorKey {
            path: AnchorPath::Paragraph { block: 2 },
            run_index: 0,
            occurrence_index: 0,
        };
        assert_eq!(dedup.slot_of(&third), Some(0));

        let plain = GlobalImageOrder::resolve(&doc, DedupPolicy::None);
        assert_eq!(plain.len(), 3);
        assert_eq!(plain.slot_of(&third), Some(2));
    }

    #[test]
    fn paged_order_is_page_then_top_down_then_left_right() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![
                Page {
                    chars: vec![],
                    images: vec![
                        page_image(300.0, 100.0, b"low"),
                        page_image(200.0, 500.0, b"top-right"),
                        page_image(10.0, 500.0, b"top-left"),
                    ],
                },
                Page {
                    chars: vec![],
                    images: vec![page_image(0.0, 900.0, b"next")],
                },
            ],
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::None);
        let paths: Vec<AnchorPath> = order.images().iter().map(|a| a.path).collect();
        assert_eq!(
            paths,
            vec![
                AnchorPath::Page { page: 0, index: 2 },
                AnchorPath::Page { page: 0, index: 1 },
                AnchorPath::Page { page: 0, index: 0 },
                AnchorPath::Page { page: 1, index: 0 },
            ]
        );
    }

    #[test]
    fn paged_ties_keep_discovery_order() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![Page {
                chars: vec![],
                images: vec![page_image(5.0, 5.0, b"a"), page_image(5.0, 5.0, b"b")],
            }],
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::None);
        let discovery: Vec<usize> = order.images().iter().map(|a| a.discovery).collect();
        assert_eq!(discovery, vec![0, 1]);
    }

    #[test]
    fn paged_dedup_uses_content_hash_only_when_requested() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![Page {
                chars: vec![],
                images: vec![page_image(0.0, 50.0, b"same"), page_image(0.0, 10.0, b"same")],
            }],
        });
        assert_eq!(GlobalImageOrder::resolve(&doc, DedupPolicy::None).len(), 2);
        assert_eq!(
            GlobalImageOrder::resolve(&doc, DedupPolicy::ByFingerprint).len(),
            1
        );
    }

    #[test]
    fn non_finite_geometry_is_dropped() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![Page {
                chars: vec![],
                images: vec![page_image(f64::NAN, 1.0, b""), page_image(1.0, 1.0, b"")],
            }],
        });
        let order = GlobalImageOrder::resolve(&doc, DedupPolicy::None);
        assert_eq!(order.len(), 1);
        assert_eq!(order.dropped(), 1);
    }
}
