//! Recover structured JSON from free-form model output.
//!
//! Model answers arrive wrapped in fences, prefixed with prose, truncated by
//! `max_tokens`, or split across several fenced blocks (one per chunk). The
//! pipeline runs an ordered list of strategies and stops at the first one
//! that yields a value:
//!
//! 1. **Clean**: parse as-is, then again after deterministic cleanup
//!    (fence markers, line endings, trailing whitespace, invisible Unicode).
//! 2. **Structural**: drop prose before the first `{`/`[`, then rebuild the
//!    bracket structure in one string-aware pass: close an unterminated
//!    string, add missing closers in LIFO order, remove trailing and
//!    repeated commas. A truncated tail that still does not parse is cut
//!    back to the last complete element. Skipped when anything but stray
//!    closers follows the first complete value.
//! 3. **Extract and merge**: parse every balanced `{…}`/`[…]` fragment
//!    (plus an unterminated trailing one) on its own and merge them into
//!    one flat array of records.
//!
//! [`repair`] never panics; when nothing parses the original text comes back
//! as [`RepairOutcome::Unrecoverable`].

use crate::pipeline::normalize::flatten_into;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Result of [`repair`].
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// Valid structured data.
    Parsed(Value),
    /// Nothing could be recovered; carries the original input unchanged.
    Unrecoverable(String),
}

impl RepairOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, RepairOutcome::Parsed(_))
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            RepairOutcome::Parsed(v) => Some(v),
            RepairOutcome::Unrecoverable(_) => None,
        }
    }
}

/// The repair strategies, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Clean,
    Structural,
    ExtractMerge,
}

type StrategyFn = fn(&str) -> Option<Value>;

const STRATEGIES: &[(Strategy, StrategyFn)] = &[
    (Strategy::Clean, parse_clean),
    (Strategy::Structural, parse_structural),
    (Strategy::ExtractMerge, parse_fragments),
];

/// Run the strategies in order and return the first parsed value.
pub fn repair(text: &str) -> RepairOutcome {
    match repair_with_strategy(text) {
        Some((value, _)) => RepairOutcome::Parsed(value),
        None => RepairOutcome::Unrecoverable(text.to_string()),
    }
}

/// Like [`repair`], also naming the strategy that succeeded.
pub fn repair_with_strategy(text: &str) -> Option<(Value, Strategy)> {
    for (strategy, run) in STRATEGIES {
        if let Some(value) = run(text) {
            debug!("JSON repaired by {:?} strategy", strategy);
            return Some((value, *strategy));
        }
    }
    debug!(
        "JSON repair failed on {} chars of model output",
        text.chars().count()
    );
    None
}

// ── Stage 1: Clean ───────────────────────────────────────────────────────

static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[A-Za-z0-9_-]*").unwrap());

/// Deterministic cleanup applied before any structural work.
pub fn clean(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_fences(&s);
    let s = trim_trailing_whitespace(&s);
    remove_invisible_chars(&s)
}

fn strip_fences(input: &str) -> String {
    RE_FENCE.replace_all(input, "").to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

fn parse(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

fn parse_clean(text: &str) -> Option<Value> {
    parse(text).or_else(|| parse(&clean(text)))
}

// ── Stage 2: Structural repair ───────────────────────────────────────────

/// How many trailing element boundaries a truncated answer may be cut back to.
const MAX_TRUNCATION_CUTS: usize = 64;

fn parse_structural(text: &str) -> Option<Value> {
    repair_structure(&clean(text))
}

fn repair_structure(text: &str) -> Option<Value> {
    let body = match text.find(['{', '[']) {
        Some(start) => &text[start..],
        None => {
            let wrapped = format!("[{}]", text.trim());
            return parse(&wrapped);
        }
    };

    let scan = Scan::run(body);
    if scan.trailing {
        debug!("Content follows the first complete value; leaving it to fragment merge");
        return None;
    }
    if let Some(value) = parse(&scan.closed()) {
        return Some(value);
    }
    if !scan.truncated() {
        return None;
    }

    for cut in scan.commas.iter().rev() {
        let Some(head) = scan.out.get(..cut.offset) else {
            continue;
        };
        let mut candidate = head.to_string();
        for closer in cut.stack.iter().rev() {
            close_into(&mut candidate, *closer);
        }
        if let Some(value) = parse(&candidate) {
            debug!("Truncated JSON cut back to offset {}", cut.offset);
            return Some(value);
        }
    }
    None
}

/// A comma outside any string together with the open brackets at that point.
struct Cut {
    offset: usize,
    stack: Vec<char>,
}

/// Result of one string-aware pass over the text.
struct Scan {
    /// Text with stray closers dropped, inner brackets closed and commas fixed.
    out: String,
    /// Expected closers still open at end of input, innermost last.
    stack: Vec<char>,
    in_string: bool,
    pending_escape: bool,
    commas: Vec<Cut>,
    /// Significant text follows the first top-level value.
    trailing: bool,
}

impl Scan {
    fn run(text: &str) -> Self {
        let mut out = String::with_capacity(text.len() + 8);
        let mut stack: Vec<char> = Vec::new();
        let mut commas: Vec<Cut> = Vec::new();
        let mut in_string = false;
        let mut escape = false;
        let mut completed = false;
        let mut trailing = false;

        for c in text.chars() {
            if completed && stack.is_empty() && !in_string {
                if !c.is_whitespace() && !matches!(c, '}' | ']' | ')') {
                    trailing = true;
                    break;
                }
                continue;
            }
            if in_string {
                out.push(c);
                if escape {
                    escape = false;
                } else if c == '\\' {
                    escape = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                '{' | '[' | '(' => {
                    stack.push(closer_for(c));
                    out.push(c);
                }
                '}' | ']' | ')' => match stack.iter().rposition(|&x| x == c) {
                    Some(pos) => {
                        while stack.len() > pos + 1 {
                            if let Some(inner) = stack.pop() {
                                close_into(&mut out, inner);
                            }
                        }
                        stack.pop();
                        close_into(&mut out, c);
                        completed = stack.is_empty();
                    }
                    None => debug!("Dropping unmatched '{}'", c),
                },
                ',' => match last_significant(&out) {
                    None | Some(',') | Some('{') | Some('[') | Some('(') => {}
                    _ => {
                        if commas.len() == MAX_TRUNCATION_CUTS {
                            commas.remove(0);
                        }
                        commas.push(Cut {
                            offset: out.len(),
                            stack: stack.clone(),
                        });
                        out.push(',');
                    }
                },
                _ => out.push(c),
            }
        }

        Self {
            out,
            stack,
            in_string,
            pending_escape: escape,
            commas,
            trailing,
        }
    }

    fn truncated(&self) -> bool {
        self.in_string || !self.stack.is_empty()
    }

    /// The scanned text with the open string and brackets closed.
    fn closed(&self) -> String {
        let mut s = self.out.clone();
        if self.in_string {
            if self.pending_escape {
                s.pop();
            }
            s.push('"');
        }
        for closer in self.stack.iter().rev() {
            close_into(&mut s, *closer);
        }
        s
    }
}

fn closer_for(open: char) -> char {
    match open {
        '{' => '}',
        '[' => ']',
        _ => ')',
    }
}

fn last_significant(s: &str) -> Option<char> {
    s.chars().rev().find(|c| !c.is_whitespace())
}

/// Append `closer`, first dropping whitespace and commas that would leave a
/// trailing comma before it.
fn close_into(out: &mut String, closer: char) {
    loop {
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        if out.ends_with(',') {
            out.pop();
        } else {
            break;
        }
    }
    out.push(closer);
}

// ── Stage 3: Extract and merge ───────────────────────────────────────────

fn parse_fragments(text: &str) -> Option<Value> {
    let cleaned = clean(text);
    let fragments = extract_fragments(&cleaned);
    if fragments.is_empty() {
        return None;
    }

    let mut merged: Vec<Value> = Vec::new();
    let mut parsed = 0usize;
    for (i, fragment) in fragments.iter().enumerate() {
        let value = parse(fragment).or_else(|| repair_structure(fragment));
        match value {
            Some(Value::Array(items)) => {
                parsed += 1;
                for item in items {
                    flatten_into(item, &mut merged);
                }
            }
            Some(obj @ Value::Object(_)) => {
                parsed += 1;
                merged.push(obj);
            }
            Some(other) => debug!("Fragment {} parsed to a scalar, skipping: {}", i, other),
            None => debug!("Fragment {} could not be repaired, skipping", i),
        }
    }

    debug!(
        "Merged {} of {} JSON fragments into {} records",
        parsed,
        fragments.len(),
        merged.len()
    );
    (parsed > 0).then_some(Value::Array(merged))
}

/// Maximal bracket-balanced substrings in order of appearance, plus the
/// unterminated tail if the text ends inside one.
fn extract_fragments(text: &str) -> Vec<&str> {
    let mut fragments = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut start = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in text.char_indices() {
        if stack.is_empty() {
            if c == '{' || c == '[' {
                start = i;
                stack.push(closer_for(c));
                in_string = false;
                escape = false;
            }
            continue;
        }
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(closer_for(c)),
            '}' | ']' => {
                if let Some(pos) = stack.iter().rposition(|&x| x == c) {
                    stack.truncate(pos);
                    if stack.is_empty() {
                        fragments.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        fragments.push(&text[start..]);
    }
    fragments
}
