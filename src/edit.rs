//! Span-based text patches.
//!
//! Edits are computed against the original text and applied in one pass,
//! highest offset first, so no edit shifts the offsets of another.

use crate::error::ValidationError;
use crate::models::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub span: Span,
    pub replacement: String,
}

impl Edit {
    pub fn replace(span: Span, replacement: impl Into<String>) -> Self {
        Self {
            span,
            replacement: replacement.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            span: Span::at(offset),
            replacement: text.into(),
        }
    }
}

/// An immutable list of edits against one original text.
#[derive(Debug, Clone, Default)]
pub struct TextPatch {
    edits: Vec<Edit>,
}

impl TextPatch {
    pub fn new(edits: Vec<Edit>) -> Self {
        Self { edits }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply every edit to `original`.
    ///
    /// Inserts sharing an offset keep their list order in the output.
    /// Replacements may not overlap each other.
    pub fn apply(&self, original: &str) -> Result<String, ValidationError> {
        let mut order: Vec<usize> = (0..self.edits.len()).collect();
        order.sort_by_key(|&i| (self.edits[i].span.start, self.edits[i].span.end, i));

        let mut out = original.to_string();
        let mut floor = original.len();

        for &i in order.iter().rev() {
            let edit = &self.edits[i];
            let Span { start, end } = edit.span;
            if start > end || end > original.len() {
                return Err(ValidationError::OverlappingEdits(start));
            }
            if !original.is_char_boundary(start) || !original.is_char_boundary(end) {
                return Err(ValidationError::OverlappingEdits(start));
            }
            if end > floor {
                return Err(ValidationError::OverlappingEdits(start));
            }
            out.replace_range(start..end, &edit.replacement);
            floor = start;
        }

        Ok(out)
    }
}

/// Leading whitespace of the line starting at `line_start`.
pub fn indentation_at(content: &str, line_start: usize) -> &str {
    let rest = &content[line_start..];
    let len = rest
        .find(|c: char| c != ' ' && c != '\t')
        .unwrap_or(rest.len());
    &rest[..len]
}

/// Byte offset of the start of the line containing `offset`.
pub fn line_start_of(content: &str, offset: usize) -> usize {
    content[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

/// Indentation unit used by a file: the first indented line's leading
/// whitespace, four spaces when nothing is indented.
pub fn indent_unit(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start_matches([' ', '\t']);
            &line[..line.len() - trimmed.len()]
        })
        .find(|indent| !indent.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "    ".to_string())
}

/// Leading whitespace of the line holding the byte at `offset`.
pub fn closing_indent(content: &str, offset: usize) -> &str {
    indentation_at(content, line_start_of(content, offset))
}

/// Insert whole lines of `text` just before the closing token at `close`.
///
/// When the token shares its line with other text, the line is broken
/// open so the inserted lines stay on their own.
pub fn insert_before_close(content: &str, close: usize, text: &str) -> Edit {
    let line_start = line_start_of(content, close);
    if content[line_start..close].trim().is_empty() {
        Edit::insert(line_start, text.to_string())
    } else {
        let indent = indentation_at(content, line_start);
        Edit::insert(close, format!("{}{}{}", newline_of(content), text, indent))
    }
}

/// Line terminator used by a file.
pub fn newline_of(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}
