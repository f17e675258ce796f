//! Applying `textDocument/didChange` content changes to mirrored files.
//!
//! LSP positions are (line, character) pairs where `character` counts UTF-16
//! code units within the line. Resolving them against Rust's UTF-8 strings
//! needs an explicit conversion or non-BMP text corrupts on edit.

use lsp_types::{Position, TextDocumentContentChangeEvent};

/// Apply `changes` in order to `text` and return the updated document.
///
/// A change without a range replaces the whole document; a ranged change
/// splices its text over the addressed span.
pub fn apply_changes(
    text: &str,
    changes: &[TextDocumentContentChangeEvent],
) -> Result<String, String> {
    let mut content = text.to_owned();
    for change in changes {
        content = match change.range {
            None => change.text.clone(),
            Some(range) => {
                let start = byte_offset(&content, range.start)?;
                let end = byte_offset(&content, range.end)?;
                if start > end {
                    return Err(format!(
                        "range start {:?} is past range end {:?}",
                        range.start, range.end
                    ));
                }
                let mut next =
                    String::with_capacity(content.len() + change.text.len());
                next.push_str(&content[..start]);
                next.push_str(&change.text);
                next.push_str(&content[end..]);
                next
            }
        };
    }
    Ok(content)
}

/// Resolve an LSP position to a byte offset into `content`.
///
/// A `character` past the end of the line clamps to the line end, as the LSP
/// specification directs. A `line` past the end of the document is an error.
fn byte_offset(content: &str, pos: Position) -> Result<usize, String> {
    let mut line_start = 0usize;
    if pos.line > 0 {
        let mut seen = 0u32;
        for (idx, _) in content.match_indices('\n') {
            seen += 1;
            if seen == pos.line {
                line_start = idx + 1;
                break;
            }
        }
        if seen < pos.line {
            return Err(format!(
                "line {} is out of range for a {}-line document",
                pos.line,
                content.lines().count()
            ));
        }
    }

    let rest = &content[line_start..];
    let line_len = rest.find('\n').unwrap_or(rest.len());
    let line = &rest[..line_len];

    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        if units >= pos.character {
            return Ok(line_start + idx);
        }
        units += u32::try_from(ch.len_utf16()).unwrap_or(2);
    }
    Ok(line_start + line_len)
}
