//! DOCX reader: zip container → [`FlowDocument`].
//!
//! Reads three parts:
//!
//! * `word/document.xml` for the body: paragraphs (style, runs with text,
//!   tabs and breaks, `a:blip` / `v:imagedata` anchors) and tables
//!   (rows → cells → paragraphs). Nested tables are folded into the cell
//!   that hosts them. Text boxes and `mc:Fallback` branches are skipped so
//!   their content is not read twice.
//! * `word/_rels/document.xml.rels` to map image relationship ids to media
//!   parts, whose bytes end up in [`FlowDocument::media`].
//! * `word/styles.xml` (optional) to turn style ids (`1`, `Heading2`) into
//!   display names (`heading 1`, `标题 2`) for section filtering.
//!
//! Merged cells are emitted once, where their `w:tc` appears.

use crate::document::{Block, Cell, FlowDocument, InlineImage, Paragraph, Run, Table};
use crate::error::CaseGenError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tracing::{debug, warn};
use zip::ZipArchive;

const DOCUMENT_PART: &str = "word/document.xml";
const RELS_PART: &str = "word/_rels/document.xml.rels";
const STYLES_PART: &str = "word/styles.xml";

/// Parse a DOCX file from disk.
pub fn read_docx_file(path: &Path) -> Result<FlowDocument, CaseGenError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CaseGenError::FileNotFound {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::PermissionDenied => CaseGenError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => CaseGenError::CorruptDocument {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;
    read_docx(&bytes, path)
}

/// Parse DOCX bytes. `path` is only used in error messages.
pub fn read_docx(bytes: &[u8], path: &Path) -> Result<FlowDocument, CaseGenError> {
    let corrupt = |detail: String| CaseGenError::CorruptDocument {
        path: path.to_path_buf(),
        detail,
    };

    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(format!("not a zip container: {e}")))?;

    let document = read_part(&mut archive, DOCUMENT_PART).ok_or_else(|| {
        CaseGenError::UnsupportedFormat {
            path: path.to_path_buf(),
            detail: format!("zip container has no {DOCUMENT_PART}; only Word documents are supported"),
        }
    })?;

    let styles = match read_part(&mut archive, STYLES_PART) {
        Some(data) => parse_style_names(&data).unwrap_or_else(|e| {
            warn!("Ignoring unreadable {}: {}", STYLES_PART, e);
            HashMap::new()
        }),
        None => HashMap::new(),
    };

    let relationships = match read_part(&mut archive, RELS_PART) {
        Some(data) => parse_image_relationships(&data).map_err(corrupt)?,
        None => HashMap::new(),
    };

    let mut media = BTreeMap::new();
    for (rel_id, target) in &relationships {
        match read_part(&mut archive, target) {
            Some(data) => {
                media.insert(rel_id.clone(), data);
            }
            None => warn!("Image relationship {} points at missing part {}", rel_id, target),
        }
    }

    let blocks = parse_body(&document, &styles).map_err(corrupt)?;
    debug!(
        "Read DOCX {}: {} blocks, {} media parts",
        path.display(),
        blocks.len(),
        media.len()
    );

    Ok(FlowDocument { blocks, media })
}

fn read_part<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<Vec<u8>> {
    let mut entry = archive.by_name(name).ok()?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}

fn attr(element: &BytesStart, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .with_checks(false)
        .filter_map(Result::ok)
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Resolve a relationship target (relative to `word/`) to a zip entry name.
fn resolve_target(target: &str) -> String {
    let raw = match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("word/{target}"),
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Image relationships: id → zip entry name. External targets are skipped.
fn parse_image_relationships(data: &[u8]) -> Result<HashMap<String, String>, String> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut rels = HashMap::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let is_image = attr(e, b"Type").is_some_and(|t| t.ends_with("/image"));
                let external = attr(e, b"TargetMode").is_some_and(|m| m == "External");
                if let (true, false, Some(id), Some(target)) =
                    (is_image, external, attr(e, b"Id"), attr(e, b"Target"))
                {
                    rels.insert(id, resolve_target(&target));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("{RELS_PART}: {e}")),
            _ => {}
        }
    }
    Ok(rels)
}

/// Style id → display name.
fn parse_style_names(data: &[u8]) -> Result<HashMap<String, String>, String> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut names = HashMap::new();
    let mut current: Option<String> = None;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"style" => {
                current = attr(e, b"styleId");
            }
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"name" =>
            {
                if let (Some(id), Some(name)) = (current.as_ref(), attr(e, b"val")) {
                    names.insert(id.clone(), name);
                }
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"style" => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
    }
    Ok(names)
}

// ── Body ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TableBuilder {
    rows: Vec<Vec<Cell>>,
    row: Option<Vec<Cell>>,
    cell: Option<Cell>,
}

struct BodyParser<'s> {
    styles: &'s HashMap<String, String>,
    blocks: Vec<Block>,
    tables: Vec<TableBuilder>,
    para: Option<Paragraph>,
    run: Option<Run>,
    in_text: bool,
    /// Depth inside skipped subtrees (text boxes, fallback branches).
    skip: usize,
}

fn is_skipped_subtree(local: &[u8]) -> bool {
    matches!(local, b"Fallback" | b"txbxContent")
}

impl<'s> BodyParser<'s> {
    fn new(styles: &'s HashMap<String, String>) -> Self {
        Self {
            styles,
            blocks: Vec::new(),
            tables: Vec::new(),
            para: None,
            run: None,
            in_text: false,
            skip: 0,
        }
    }

    fn start(&mut self, e: &BytesStart) {
        match e.local_name().as_ref() {
            b"p" => self.open_paragraph(),
            b"r" if self.para.is_some() => self.run = Some(Run::default()),
            b"t" if self.run.is_some() => self.in_text = true,
            b"tbl" => {
                self.close_paragraph();
                self.tables.push(TableBuilder::default());
            }
            b"tr" => {
                if let Some(t) = self.tables.last_mut() {
                    t.row = Some(Vec::new());
                }
            }
            b"tc" => {
                if let Some(t) = self.tables.last_mut() {
                    t.cell = Some(Cell::default());
                }
            }
            _ => self.leaf(e),
        }
    }

    /// Elements that carry data in attributes and may be empty or not.
    fn leaf(&mut self, e: &BytesStart) {
        match e.local_name().as_ref() {
            b"pStyle" => {
                if let (Some(p), Some(id)) = (self.para.as_mut(), attr(e, b"val")) {
                    p.style = Some(self.styles.get(&id).cloned().unwrap_or(id));
                }
            }
            b"tab" if self.run.is_some() && !self.in_text => self.push_text("\t"),
            b"br" | b"cr" => self.push_text("\n"),
            b"blip" => self.push_image(attr(e, b"embed")),
            b"imagedata" => self.push_image(attr(e, b"id")),
            _ => {}
        }
    }

    fn end(&mut self, local: &[u8]) {
        match local {
            b"t" => self.in_text = false,
            b"r" => {
                if let (Some(run), Some(p)) = (self.run.take(), self.para.as_mut()) {
                    p.runs.push(run);
                }
            }
            b"p" => self.close_paragraph(),
            b"tc" => {
                if let Some(t) = self.tables.last_mut() {
                    if let (Some(cell), Some(row)) = (t.cell.take(), t.row.as_mut()) {
                        row.push(cell);
                    }
                }
            }
            b"tr" => {
                if let Some(t) = self.tables.last_mut() {
                    if let Some(row) = t.row.take() {
                        t.rows.push(row);
                    }
                }
            }
            b"tbl" => self.close_table(),
            _ => {}
        }
    }

    fn open_paragraph(&mut self) {
        if self.para.is_some() {
            self.close_paragraph();
        }
        self.para = Some(Paragraph::default());
    }

    fn close_paragraph(&mut self) {
        if let Some(run) = self.run.take() {
            if let Some(p) = self.para.as_mut() {
                p.runs.push(run);
            }
        }
        let Some(p) = self.para.take() else {
            return;
        };
        match self.tables.last_mut() {
            None => self.blocks.push(Block::Paragraph(p)),
            Some(t) => match t.cell.as_mut() {
                Some(cell) => cell.paragraphs.push(p),
                None => debug!("Dropping paragraph outside any table cell"),
            },
        }
    }

    fn close_table(&mut self) {
        let Some(table) = self.tables.pop() else {
            return;
        };
        match self.tables.last_mut() {
            None => self.blocks.push(Block::Table(Table { rows: table.rows })),
            Some(host) => {
                // Nested table: its paragraphs join the hosting cell.
                let paragraphs = table
                    .rows
                    .into_iter()
                    .flatten()
                    .flat_map(|c| c.paragraphs);
                match host.cell.as_mut() {
                    Some(cell) => cell.paragraphs.extend(paragraphs),
                    None => debug!("Dropping nested table outside any cell"),
                }
            }
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(run) = self.run.as_mut() {
            run.text.push_str(text);
        }
    }

    fn push_image(&mut self, rel_id: Option<String>) {
        match self.run.as_mut() {
            Some(run) => run.images.push(InlineImage { rel_id }),
            None => debug!("Ignoring image reference outside a run"),
        }
    }

    fn finish(mut self) -> Vec<Block> {
        self.close_paragraph();
        while !self.tables.is_empty() {
            self.close_table();
        }
        self.blocks
    }
}

fn parse_body(data: &[u8], styles: &HashMap<String, String>) -> Result<Vec<Block>, String> {
    let mut reader = Reader::from_reader(data);
    reader.trim_text(false);
    let mut buf = Vec::new();
    let mut parser = BodyParser::new(styles);

    loop {
        buf.clear();
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| format!("{DOCUMENT_PART} at byte {}: {e}", reader.buffer_position()))?;
        match event {
            Event::Eof => break,
            Event::Start(ref e) if is_skipped_subtree(e.local_name().as_ref()) => parser.skip += 1,
            Event::End(ref e) if is_skipped_subtree(e.local_name().as_ref()) => {
                parser.skip = parser.skip.saturating_sub(1)
            }
            _ if parser.skip > 0 => {}
            Event::Start(ref e) => parser.start(e),
            Event::Empty(ref e) => match e.local_name().as_ref() {
                b"p" => {
                    parser.open_paragraph();
                    parser.close_paragraph();
                }
                _ => parser.leaf(e),
            },
            Event::Text(ref t) if parser.in_text => {
                let text = t
                    .unescape()
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()));
                parser.push_text(&text);
            }
            Event::End(ref e) => parser.end(e.local_name().as_ref()),
            _ => {}
        }
    }

    Ok(parser.finish())
}

/// Build a minimal DOCX in memory from a `<w:body>` fragment.
#[cfg(test)]
pub(crate) fn build_docx(body: &str, media: &[(&str, &str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::FileOptions;

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = FileOptions::default();

    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"
  xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"
  xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
  xmlns:mc="http://schemas.openxmlformats.org/markup-compatibility/2006"
  xmlns:wps="http://schemas.microsoft.com/office/word/2010/wordprocessingShape"
  xmlns:v="urn:schemas-microsoft-com:vml"><w:body>{body}</w:body></w:document>"#
    );
    zip.start_file(DOCUMENT_PART, opts).unwrap();
    zip.write_all(document.as_bytes()).unwrap();

    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (id, target, _) in media {
        rels.push_str(&format!(
            r#"<Relationship Id="{id}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="{target}"/>"#
        ));
    }
    rels.push_str("</Relationships>");
    zip.start_file(RELS_PART, opts).unwrap();
    zip.write_all(rels.as_bytes()).unwrap();

    zip.start_file(STYLES_PART, opts).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?><w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:style w:type="paragraph" w:styleId="2"><w:name w:val="heading 1"/></w:style><w:style w:type="paragraph" w:styleId="TOC1"><w:name w:val="toc 1"/></w:style></w:styles>"#,
    )
    .unwrap();

    for (_, target, data) in media {
        zip.start_file(resolve_target(target), opts).unwrap();
        zip.write_all(data).unwrap();
    }

    zip.finish().unwrap().into_inner()
}
