//! Source positions of the records in a block sequence document.
//!
//! serde_yaml drops comments and quoting, so records are copied out of and
//! spliced back into the document text directly. Items are found line by
//! line: an item starts at a `- ` line on the sequence's own indentation and
//! owns every deeper line after it. Each located item is parsed on its own and
//! must equal the record serde_yaml read from the whole document, otherwise
//! the document has no layout (flow sequences, anchors shared between items,
//! multiple documents) and callers re-serialize instead.

use serde_yaml::Value;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceLayout {
    indent: usize,
    items: Vec<Range<usize>>,
    sources: Vec<String>,
}

impl SequenceLayout {
    /// Locate every item of `text`, whose parsed records are `records`.
    pub fn scan(text: &str, records: &[Value]) -> Option<Self> {
        let mut indent = None;
        let mut items = Vec::new();
        let mut current: Option<Range<usize>> = None;
        let mut offset = 0;

        for line in text.split_inclusive('\n') {
            let start = offset;
            offset += line.len();

            let body = line.trim_end_matches(['\n', '\r']);
            let trimmed = body.trim_start_matches(' ');
            if trimmed.trim_end().is_empty() {
                continue;
            }
            let column = body.len() - trimmed.len();

            let Some(indent) = indent else {
                if is_preamble(trimmed) {
                    continue;
                }
                if !is_item_start(trimmed) {
                    return None;
                }
                indent = Some(column);
                current = Some(start..offset);
                continue;
            };

            if column > indent {
                if let Some(item) = current.as_mut() {
                    item.end = offset;
                }
            } else if trimmed.starts_with('#') {
                // Separator comment; stays outside the item unless the item continues below it.
            } else if column == indent && is_item_start(trimmed) {
                items.extend(current.replace(start..offset));
            } else {
                return None;
            }
        }
        items.extend(current);

        if items.len() != records.len() {
            return None;
        }
        let indent = indent.unwrap_or(0);
        let sources = items
            .iter()
            .zip(records)
            .map(|(range, record)| {
                let source = unindent_item(&text[range.clone()], indent)?;
                let parsed: Value = serde_yaml::from_str(&source).ok()?;
                (&parsed == record).then_some(source)
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self { indent, items, sources })
    }

    /// Text of record `index` as a standalone document, exactly as written
    /// apart from the item marker and the item's indentation.
    pub fn source(&self, index: usize) -> Option<&str> {
        self.sources.get(index).map(String::as_str)
    }

    /// `text` with item `index` replaced by `record`. Bytes outside that item
    /// are left untouched.
    pub fn replace(&self, text: &str, index: usize, record: &str) -> Option<String> {
        let range = self.items.get(index)?;
        let mut merged = String::with_capacity(text.len() + record.len());
        merged.push_str(&text[..range.start]);
        merged.push_str(&self.render_item(record));
        merged.push_str(&text[range.end..]);
        Some(merged)
    }

    /// `text` with `record` added as the last item.
    pub fn append(&self, text: &str, record: &str) -> String {
        let mut merged = String::with_capacity(text.len() + record.len() + 2);
        merged.push_str(text);
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&self.render_item(record));
        merged
    }

    /// A standalone record turned into an item of this sequence.
    fn render_item(&self, record: &str) -> String {
        let marker = format!("{}- ", " ".repeat(self.indent));
        let continuation = " ".repeat(self.indent + 2);

        let mut item = String::with_capacity(record.len() + marker.len());
        for (index, line) in record.trim_start_matches(['\n', '\r']).split_inclusive('\n').enumerate() {
            if index == 0 {
                item.push_str(&marker);
            } else if !line.trim().is_empty() {
                item.push_str(&continuation);
            }
            item.push_str(line);
        }
        if !item.ends_with('\n') {
            item.push('\n');
        }
        item
    }
}

fn is_preamble(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with('%') || trimmed.trim_end() == "---"
}

fn is_item_start(trimmed: &str) -> bool {
    let trimmed = trimmed.trim_end();
    trimmed == "-" || trimmed.starts_with("- ")
}

/// Strip the `- ` marker and the item's indentation from every line.
fn unindent_item(item: &str, indent: usize) -> Option<String> {
    let mut lines = item.split_inclusive('\n');
    let first = lines.next()?;
    let after_marker = first.get(indent + 1..)?;
    let content = after_marker.trim_start_matches(' ');
    let rest: Vec<&str> = lines.collect();

    let column = if content.trim().is_empty() {
        // Marker alone on its line; the record starts on the next one.
        rest.iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.len() - line.trim_start_matches(' ').len())
            .min()?
    } else {
        first.len() - content.len()
    };

    let mut source = String::with_capacity(item.len());
    if !content.trim().is_empty() {
        source.push_str(content);
    }
    for line in rest {
        let spaces = line.len() - line.trim_start_matches(' ').len();
        let significant = !line.trim().is_empty() && !line.trim_start().starts_with('#');
        if significant && spaces < column {
            return None;
        }
        source.push_str(&line[spaces.min(column)..]);
    }
    Some(source)
}
