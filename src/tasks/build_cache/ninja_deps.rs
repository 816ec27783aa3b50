//! In-place rewriter for ninja's binary dependency database (`.ninja_deps`).
//!
//! The file is consulted on every incremental build, so a textual
//! substitution across the whole byte stream would destroy record framing.
//! Each record is parsed, its string field substituted, and the record
//! re-framed with correct length and alignment; malformed tails are copied
//! through verbatim rather than risking corruption.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Rewrite every occurrence of `source` inside a record's string field with
/// `target`, leaving the file byte-identical if `source` never occurs.
///
/// # Errors
///
/// Returns an error only on I/O failure reading or writing `path`.
pub fn patch(path: &Path, source: &[u8], target: &[u8]) -> Result<()> {
    let original = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rewritten = rewrite_bytes(&original, source, target);
    if rewritten != original {
        fs::write(path, rewritten).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn rewrite_bytes(input: &[u8], source: &[u8], target: &[u8]) -> Vec<u8> {
    let Some(header_end) = find_header_end(input) else {
        return input.to_vec();
    };

    let mut output = Vec::with_capacity(input.len());
    output.extend_from_slice(&input[..header_end]);

    let mut cursor = header_end;
    loop {
        match rewrite_one_record(&input[cursor..], source, target) {
            Some((consumed, record_bytes)) => {
                output.extend_from_slice(&record_bytes);
                cursor += consumed;
                if cursor >= input.len() {
                    break;
                }
            }
            None => {
                output.extend_from_slice(&input[cursor..]);
                break;
            }
        }
    }
    output
}

/// The header is a single newline-terminated ASCII line followed by a
/// 4-byte version. Returns the byte offset where records begin.
fn find_header_end(input: &[u8]) -> Option<usize> {
    let newline_index = input.iter().position(|&b| b == b'\n')?;
    let version_end = newline_index + 1 + 4;
    if version_end > input.len() {
        return None;
    }
    Some(version_end)
}

/// Parse and rewrite one record. Returns `(bytes consumed from input, new
/// record bytes)`, or `None` if the record is malformed and the rest of the
/// input should be copied through verbatim.
fn rewrite_one_record(input: &[u8], source: &[u8], target: &[u8]) -> Option<(usize, Vec<u8>)> {
    if input.len() < 4 {
        return None;
    }
    let length_bytes: [u8; 4] = input.get(..4)?.try_into().ok()?;
    let length = u32::from_le_bytes(length_bytes) as usize;

    let payload_start = 4;
    let payload_end = payload_start.checked_add(length)?;
    let id_end = payload_end.checked_add(4)?;
    if id_end > input.len() {
        return None;
    }
    let payload = input.get(payload_start..payload_end)?;
    let id_bytes = input.get(payload_end..id_end)?;

    let Some(nul_index) = payload.iter().position(|&b| b == 0) else {
        return None;
    };
    let string_bytes = payload.get(..nul_index)?;

    let new_string = replace_bytes(string_bytes, source, target);
    let new_record = encode_record(&new_string, id_bytes);
    Some((id_end, new_record))
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut output = Vec::with_capacity(haystack.len());
    let mut index = 0;
    while index < haystack.len() {
        if haystack[index..].starts_with(needle) {
            output.extend_from_slice(replacement);
            index += needle.len();
        } else {
            output.push(haystack[index]);
            index += 1;
        }
    }
    output
}

fn encode_record(string_bytes: &[u8], id_bytes: &[u8]) -> Vec<u8> {
    let string_and_nul_len = string_bytes.len() + 1;
    let padding = (4 - string_and_nul_len % 4) % 4;
    let length = string_and_nul_len + padding;

    let mut record = Vec::with_capacity(4 + length + 4);
    #[expect(clippy::cast_possible_truncation, reason = "record length is bounded by record payload size")]
    record.extend_from_slice(&(length as u32).to_le_bytes());
    record.extend_from_slice(string_bytes);
    record.push(0);
    record.extend(std::iter::repeat_n(0u8, padding));
    record.extend_from_slice(id_bytes);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_input(string: &[u8], id: u32) -> Vec<u8> {
        let mut input = b"# ninjadeps\n".to_vec();
        input.extend_from_slice(&1u32.to_le_bytes());
        input.extend_from_slice(&encode_record(string, &id.to_le_bytes()));
        input
    }

    #[test]
    fn leaves_file_untouched_when_source_absent() {
        let input = build_input(b"/other/path/foo.o", 1);
        let output = rewrite_bytes(&input, b"/src/a", b"/tmp/longer/a");
        assert_eq!(output, input);
    }

    #[test]
    fn rewrites_matching_record_and_preserves_id() {
        let input = build_input(b"/src/a/foo.o", 1);
        let output = rewrite_bytes(&input, b"/src/a", b"/tmp/longer/a");

        let header_end = find_header_end(&input).expect("header");
        let (consumed, record) =
            rewrite_one_record(&output[header_end..], b"", b"").expect("record");
        assert_eq!(consumed, record.len());

        let length = u32::from_le_bytes(record[..4].try_into().expect("4 bytes"));
        assert_eq!(length, 20);
        assert_eq!(&record[4..24], b"/tmp/longer/a/foo.o\0");
        let id = u32::from_le_bytes(record[record.len() - 4..].try_into().expect("4 bytes"));
        assert_eq!(id, 1);
    }

    #[test]
    fn preserves_header_bytes_exactly() {
        let input = build_input(b"/src/a/foo.o", 7);
        let output = rewrite_bytes(&input, b"/src/a", b"/tmp/longer/a");
        let header_end = find_header_end(&input).expect("header");
        assert_eq!(&output[..header_end], &input[..header_end]);
    }

    #[test]
    fn copies_truncated_record_through_verbatim() {
        let mut input = b"# ninjadeps\n".to_vec();
        input.extend_from_slice(&1u32.to_le_bytes());
        // Declares a length far larger than the remaining bytes.
        input.extend_from_slice(&1000u32.to_le_bytes());
        input.extend_from_slice(b"short");

        let output = rewrite_bytes(&input, b"/src/a", b"/tmp/longer/a");
        assert_eq!(output, input);
    }
}
