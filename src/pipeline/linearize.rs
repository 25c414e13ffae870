//! Flatten a [`DocumentSource`] into one reading-order string.
//!
//! Image anchors are resolved through the [`GlobalImageOrder`]; each slot's
//! reconciled replacement is spliced in where the image sits. An empty
//! replacement leaves no trace in the output.

use crate::document::{
    AnchorKey, AnchorPath, Block, DocumentSource, FlowDocument, PagedDocument, Paragraph, Table,
};
use crate::pipeline::order::GlobalImageOrder;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Formatting knobs for [`linearize`].
#[derive(Debug, Clone)]
pub struct LinearizeOptions {
    /// Text placed before a flow-mode image replacement.
    pub image_prefix: String,
    /// Text placed after a flow-mode image replacement.
    pub image_suffix: String,
    /// Separator between table cells of one row.
    pub column_separator: String,
    /// Maximum vertical distance for two characters to share a line (paged).
    pub line_tolerance: f64,
    /// Section title keywords; empty keeps the whole document (flow only).
    pub section_titles: Vec<String>,
}

impl Default for LinearizeOptions {
    fn default() -> Self {
        Self {
            image_prefix: "[图片:".into(),
            image_suffix: "]".into(),
            column_separator: " | ".into(),
            line_tolerance: 1.0,
            section_titles: Vec::new(),
        }
    }
}

/// Produce the linear text of `source`.
///
/// `replacements` must be index-aligned with `order` (see
/// [`crate::pipeline::reconcile::reconcile`]); a missing entry is treated
/// as empty.
pub fn linearize(
    source: &DocumentSource,
    order: &GlobalImageOrder,
    replacements: &[String],
    options: &LinearizeOptions,
) -> String {
    if replacements.len() != order.len() {
        warn!(
            "linearize called with {} replacements for {} image slots",
            replacements.len(),
            order.len()
        );
    }
    let text = match source {
        DocumentSource::Flow(doc) => linearize_flow(doc, order, replacements, options),
        DocumentSource::Paged(doc) => {
            if !options.section_titles.is_empty() {
                debug!("Section filtering applies to flow documents only; ignoring for paged input");
            }
            linearize_paged(doc, order, replacements, options)
        }
    };
    debug!(
        "Linearized {} document into {} chars",
        source.kind(),
        text.chars().count()
    );
    text
}

fn replacement_for<'a>(
    order: &GlobalImageOrder,
    replacements: &'a [String],
    key: &AnchorKey,
) -> Option<&'a str> {
    let slot = order.slot_of(key)?;
    replacements
        .get(slot)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

// ── Flow mode ────────────────────────────────────────────────────────────

fn linearize_flow(
    doc: &FlowDocument,
    order: &GlobalImageOrder,
    replacements: &[String],
    options: &LinearizeOptions,
) -> String {
    let mut filter = SectionFilter::new(&options.section_titles);
    let mut out: Vec<String> = Vec::new();

    for (block_idx, block) in doc.blocks.iter().enumerate() {
        if !filter.keep(block) {
            continue;
        }
        let text = match block {
            Block::Paragraph(p) => render_paragraph(
                p,
                AnchorPath::Paragraph { block: block_idx },
                order,
                replacements,
                options,
            ),
            Block::Table(t) => render_table(t, block_idx, order, replacements, options),
        };
        if !text.is_empty() {
            out.push(text);
        }
    }
    out.join("\n")
}

fn render_paragraph(
    paragraph: &Paragraph,
    path: AnchorPath,
    order: &GlobalImageOrder,
    replacements: &[String],
    options: &LinearizeOptions,
) -> String {
    let mut text = String::new();
    for (run_index, run) in paragraph.runs.iter().enumerate() {
        text.push_str(&run.text);
        for occurrence_index in 0..run.images.len() {
            let key = AnchorKey {
                path,
                run_index,
                occurrence_index,
            };
            if let Some(replacement) = replacement_for(order, replacements, &key) {
                text.push_str(&options.image_prefix);
                text.push_str(replacement);
                text.push_str(&options.image_suffix);
            }
        }
    }
    text
}

fn render_table(
    table: &Table,
    block: usize,
    order: &GlobalImageOrder,
    replacements: &[String],
    options: &LinearizeOptions,
) -> String {
    let mut rows: Vec<String> = Vec::with_capacity(table.rows.len());
    for (row, cells) in table.rows.iter().enumerate() {
        let rendered: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(column, cell)| {
                cell.paragraphs
                    .iter()
                    .enumerate()
                    .map(|(paragraph, p)| {
                        let path = AnchorPath::TableCell {
                            block,
                            row,
                            column,
                            paragraph,
                        };
                        render_paragraph(p, path, order, replacements, options)
                    })
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        if rendered.iter().all(String::is_empty) {
            continue;
        }
        rows.push(rendered.join(&options.column_separator));
    }
    rows.join("\n")
}

// ── Section filtering ────────────────────────────────────────────────────

static NUMBERED_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)*\s+\S").unwrap());

const HEADING_STYLE_KEYWORDS: &[&str] = &["heading", "标题", "header", "chapter"];

/// Keeps only the blocks belonging to sections whose title contains one of
/// the configured keywords.
///
/// Capture starts at a non-TOC heading containing a keyword and ends at the
/// next heading that contains none. Body text mentioning a keyword does not
/// start a section. Tables and images inside a
/// captured section are kept. With no keywords every block is kept.
#[derive(Debug, Clone)]
pub struct SectionFilter {
    titles: Vec<String>,
    capturing: bool,
}

impl SectionFilter {
    pub fn new(titles: &[String]) -> Self {
        Self {
            titles: titles
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            capturing: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.titles.is_empty()
    }

    /// Feed the next block in document order; returns whether it is kept.
    pub fn keep(&mut self, block: &Block) -> bool {
        if !self.is_active() {
            return true;
        }
        let Block::Paragraph(p) = block else {
            return self.capturing;
        };
        if is_toc(p) {
            return false;
        }
        let text = p.text();
        let text = text.trim();
        if text.is_empty() {
            return self.capturing;
        }

        if !is_heading(p) {
            return self.capturing;
        }
        let matches = self.titles.iter().any(|t| text.contains(t.as_str()));
        if matches && !self.capturing {
            debug!("Section capture starts at '{}'", text);
        } else if !matches && self.capturing {
            debug!("Section capture ends at '{}'", text);
        }
        self.capturing = matches;
        self.capturing
    }
}

fn is_toc(p: &Paragraph) -> bool {
    p.style
        .as_deref()
        .is_some_and(|s| s.to_lowercase().contains("toc"))
}

/// Heading by style name or by `1.2.3 Title` numbering.
pub fn is_heading(p: &Paragraph) -> bool {
    let style_match = p.style.as_deref().is_some_and(|s| {
        let lower = s.to_lowercase();
        !lower.contains("toc") && HEADING_STYLE_KEYWORDS.iter().any(|k| lower.contains(k))
    });
    style_match || NUMBERED_HEADING.is_match(p.text().trim())
}

// ── Paged mode ───────────────────────────────────────────────────────────

struct Element<'a> {
    y0: f64,
    x0: f64,
    content: std::borrow::Cow<'a, str>,
}

fn linearize_paged(
    doc: &PagedDocument,
    order: &GlobalImageOrder,
    replacements: &[String],
    options: &LinearizeOptions,
) -> String {
    let mut pages: Vec<String> = Vec::with_capacity(doc.pages.len());

    for (page_idx, page) in doc.pages.iter().enumerate() {
        let mut elements: Vec<Element<'_>> = Vec::new();

        // ── Text lines ──
        let mut chars: Vec<_> = page
            .chars
            .iter()
            .filter(|c| c.x0.is_finite() && c.y0.is_finite())
            .collect();
        chars.sort_by(|a, b| a.y0.total_cmp(&b.y0).then_with(|| a.x0.total_cmp(&b.x0)));

        let mut line: Vec<&crate::document::PositionedChar> = Vec::new();
        for c in chars {
            let new_line = line
                .first()
                .is_some_and(|first| (c.y0 - first.y0).abs() > options.line_tolerance);
            if new_line {
                elements.push(line_element(&mut line));
            }
            line.push(c);
        }
        if !line.is_empty() {
            elements.push(line_element(&mut line));
        }

        // ── Image placeholders ──
        for (index, img) in page.images.iter().enumerate() {
            let key = AnchorKey {
                path: AnchorPath::Page {
                    page: page_idx,
                    index,
                },
                run_index: 0,
                occurrence_index: 0,
            };
            if let Some(replacement) = replacement_for(order, replacements, &key) {
                elements.push(Element {
                    y0: img.y0,
                    x0: img.x0,
                    content: replacement.into(),
                });
            }
        }

        elements.sort_by(|a, b| b.y0.total_cmp(&a.y0).then_with(|| a.x0.total_cmp(&b.x0)));
        let page_text = elements
            .iter()
            .map(|e| e.content.as_ref())
            .collect::<Vec<_>>()
            .join(" ");
        if !page_text.is_empty() {
            pages.push(page_text);
        }
    }
    pages.join(" ")
}

/// Close the current line: anchor it at its first character, order the
/// characters left to right.
fn line_element<'a>(line: &mut Vec<&'a crate::document::PositionedChar>) -> Element<'a> {
    let (y0, x0) = (line[0].y0, line[0].x0);
    line.sort_by(|a, b| a.x0.total_cmp(&b.x0));
    let content: String = line.iter().map(|c| c.text.as_str()).collect();
    line.clear();
    Element {
        y0,
        x0,
        content: content.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Cell, InlineImage, Page, PageImage, PositionedChar, Run};
    use crate::pipeline::order::DedupPolicy;
    use crate::pipeline::reconcile::reconcile;
    use std::collections::BTreeMap;

    fn text_para(text: &str) -> Paragraph {
        Paragraph {
            style: None,
            runs: vec![Run {
                text: text.into(),
                images: vec![],
            }],
        }
    }

    fn styled(style: &str, text: &str) -> Block {
        let mut p = text_para(text);
        p.style = Some(style.into());
        Block::Paragraph(p)
    }

    fn image_para(text: &str, rel_id: &str) -> Paragraph {
        Paragraph {
            style: None,
            runs: vec![Run {
                text: text.into(),
                images: vec![InlineImage {
                    rel_id: Some(rel_id.into()),
                }],
            }],
        }
    }

    fn media(ids: &[&str]) -> BTreeMap<String, Vec<u8>> {
        ids.iter().map(|id| (id.to_string(), vec![0u8; 4])).collect()
    }

    fn run(source: &DocumentSource, replacements: &[&str], options: &LinearizeOptions) -> String {
        let order = GlobalImageOrder::resolve(source, DedupPolicy::ByFingerprint);
        let list = reconcile(
            replacements.iter().map(|s| s.to_string()).collect(),
            order.len(),
        );
        linearize(source, &order, &list, options)
    }

    fn table_with_image() -> Block {
        Block::Table(Table {
            rows: vec![
                vec![
                    Cell {
                        paragraphs: vec![text_para("步骤")],
                    },
                    Cell {
                        paragraphs: vec![image_para("截图", "rB")],
                    },
                ],
                vec![Cell { paragraphs: vec![] }, Cell { paragraphs: vec![] }],
            ],
        })
    }

    fn scenario_doc() -> DocumentSource {
        DocumentSource::Flow(FlowDocument {
            blocks: vec![
                Block::Paragraph(text_para("P1")),
                Block::Paragraph(image_para("P2", "rA")),
                table_with_image(),
                Block::Paragraph(text_para("P3")),
            ],
            media: media(&["rA", "rB"]),
        })
    }

    #[test]
    fn flow_table_stays_between_its_paragraphs() {
        let out = run(&scenario_doc(), &["catA", "catB"], &LinearizeOptions::default());
        assert_eq!(out, "P1\nP2[图片:catA]\n步骤 | 截图[图片:catB]\nP3");
    }

    #[test]
    fn empty_replacements_leave_no_markers() {
        let out = run(&scenario_doc(), &[], &LinearizeOptions::default());
        assert_eq!(out, "P1\nP2\n步骤 | 截图\nP3");
        assert!(!out.contains("[图片:"));
    }

    #[test]
    fn each_slot_consumes_its_own_replacement_in_order() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: (0..5)
                .map(|i| Block::Paragraph(image_para(&format!("p{i}"), &format!("r{i}"))))
                .collect(),
            media: media(&["r0", "r1", "r2", "r3", "r4"]),
        });
        let out = run(&doc, &["a", "b", "c", "d", "e"], &LinearizeOptions::default());
        assert_eq!(
            out,
            "p0[图片:a]\np1[图片:b]\np2[图片:c]\np3[图片:d]\np4[图片:e]"
        );
    }

    #[test]
    fn dropped_anchor_does_not_shift_later_replacements() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                Block::Paragraph(image_para("x", "broken")),
                Block::Paragraph(image_para("y", "rOk")),
            ],
            media: media(&["rOk"]),
        });
        let out = run(&doc, &["first"], &LinearizeOptions::default());
        assert_eq!(out, "x\ny[图片:first]");
    }

    #[test]
    fn duplicate_image_repeats_first_replacement() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                Block::Paragraph(image_para("a", "r1")),
                Block::Paragraph(image_para("b", "r1")),
            ],
            media: media(&["r1"]),
        });
        let out = run(&doc, &["logo"], &LinearizeOptions::default());
        assert_eq!(out, "a[图片:logo]\nb[图片:logo]");
    }

    #[test]
    fn custom_separator_and_marker() {
        let options = LinearizeOptions {
            image_prefix: "<img ".into(),
            image_suffix: ">".into(),
            column_separator: "\t".into(),
            ..LinearizeOptions::default()
        };
        let out = run(&scenario_doc(), &["A", "B"], &options);
        assert!(out.contains("步骤\t截图<img B>"), "got: {out}");
    }

    #[test]
    fn section_filter_keeps_matching_section_with_tables() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                styled("TOC1", "3.1 登录功能"),
                styled("Heading1", "1 概述"),
                Block::Paragraph(text_para("intro")),
                styled("Heading1", "2 登录功能"),
                Block::Paragraph(text_para("用户输入密码")),
                table_with_image(),
                styled("Heading1", "3 注册功能"),
                Block::Paragraph(text_para("other")),
            ],
            media: media(&["rB"]),
        });
        let options = LinearizeOptions {
            section_titles: vec!["登录".into()],
            ..LinearizeOptions::default()
        };
        let out = run(&doc, &["B"], &options);
        assert_eq!(out, "2 登录功能\n用户输入密码\n步骤 | 截图[图片:B]");
    }

    #[test]
    fn keyword_in_body_text_does_not_start_a_section() {
        let doc = DocumentSource::Flow(FlowDocument {
            blocks: vec![
                styled("Heading1", "概述"),
                Block::Paragraph(text_para("本系统支持登录和注册")),
                Block::Paragraph(text_para("intro")),
                styled("Heading1", "登录功能"),
                Block::Paragraph(text_para("登录失败提示")),
                styled("Heading1", "注册功能"),
                Block::Paragraph(text_para("注册后可登录")),
            ],
            media: media(&[]),
        });
        let options = LinearizeOptions {
            section_titles: vec!["登录".into()],
            ..LinearizeOptions::default()
        };
        let out = run(&doc, &[], &options);
        assert_eq!(out, "登录功能\n登录失败提示");
    }

    #[test]
    fn numbered_text_counts_as_heading() {
        assert!(is_heading(&text_para("4.2 权限管理")));
        assert!(!is_heading(&text_para("2024年的需求")));
        let toc = Paragraph {
            style: Some("TOC Heading".into()),
            runs: vec![],
        };
        assert!(!is_heading(&toc));
    }

    fn ch(text: &str, x0: f64, y0: f64) -> PositionedChar {
        PositionedChar {
            text: text.into(),
            x0,
            y0,
        }
    }

    #[test]
    fn paged_elements_read_top_down_then_left_right() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![
                Page {
                    chars: vec![
                        ch("B", 20.0, 700.4),
                        ch("A", 10.0, 700.0),
                        ch("C", 10.0, 300.0),
                    ],
                    images: vec![PageImage {
                        x0: 10.0,
                        y0: 500.0,
                        x1: 100.0,
                        y1: 600.0,
                        data: vec![],
                    }],
                },
                Page {
                    chars: vec![ch("D", 0.0, 10.0)],
                    images: vec![],
                },
            ],
        });
        let out = run(&doc, &["IMG"], &LinearizeOptions::default());
        assert_eq!(out, "AB IMG C D");
    }

    #[test]
    fn paged_empty_replacement_contributes_nothing() {
        let doc = DocumentSource::Paged(PagedDocument {
            pages: vec![Page {
                chars: vec![ch("x", 0.0, 100.0), ch("y", 0.0, 10.0)],
                images: vec![PageImage {
                    x0: 0.0,
                    y0: 50.0,
                    ..PageImage::default()
                }],
            }],
        });
        let out = run(&doc, &[], &LinearizeOptions::default());
        assert_eq!(out, "x y");
    }
}
