//! On-disk format constants and line-level encoding/decoding.
//!
//! The serialized index is a text/binary hybrid: a signature line, three
//! `option=value` lines, a blank line, one line per node in ascending key
//! order, and a trailing blank line. Node lines carry `key_elements + 3`
//! `\x00`-separated fields: the key elements, an absent marker, the encoded
//! reference lists, and the value.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::{Result, TesseraError};
use crate::key::Key;

/// First line of every serialized index.
pub const SIGNATURE: &[u8] = b"Tessera Graph Index 1\n";

pub(crate) const OPTION_NODE_REFS: &[u8] = b"node_ref_lists=";
pub(crate) const OPTION_KEY_ELEMENTS: &[u8] = b"key_elements=";
pub(crate) const OPTION_LEN: &[u8] = b"len=";

/// Marker stored in a node line's absent field for placeholder nodes.
pub(crate) const ABSENT_MARKER: u8 = b'a';

/// Bytes requested when probing a file for its header alone.
pub(crate) const HEADER_PROBE_LEN: usize = 200;

/// Separator between reference lists.
pub(crate) const LIST_SEP: u8 = b'\t';
/// Separator between references within one list.
pub(crate) const REF_SEP: u8 = b'\r';

/// Parsed header fields of a serialized index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    /// Reference lists carried by every node.
    pub node_ref_lists: usize,
    /// Elements in every key.
    pub key_elements: usize,
    /// Real nodes in the index (absent placeholders excluded).
    pub key_count: u64,
    /// Bytes occupied by the header, including its terminating blank line.
    pub len: usize,
}

/// Renders the header, including the blank line that terminates it.
pub(crate) fn encode_header(
    node_ref_lists: usize,
    key_elements: usize,
    key_count: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIGNATURE.len() + 48);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(OPTION_NODE_REFS);
    out.extend_from_slice(node_ref_lists.to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(OPTION_KEY_ELEMENTS);
    out.extend_from_slice(key_elements.to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(OPTION_LEN);
    out.extend_from_slice(key_count.to_string().as_bytes());
    out.push(b'\n');
    out.push(b'\n');
    out
}

fn parse_option_line<'a>(
    path: &str,
    data: &'a [u8],
    pos: &mut usize,
    option: &[u8],
) -> Result<&'a [u8]> {
    let rest = &data[*pos..];
    let end = rest.iter().position(|b| *b == b'\n').ok_or_else(|| {
        TesseraError::BadOptions(format!("{path}: truncated header"))
    })?;
    let line = &rest[..end];
    let value = line.strip_prefix(option).ok_or_else(|| {
        TesseraError::BadOptions(format!(
            "{path}: expected {} line",
            String::from_utf8_lossy(option)
        ))
    })?;
    *pos += end + 1;
    Ok(value)
}

fn parse_decimal(path: &str, field: &[u8]) -> Result<u64> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| {
            TesseraError::BadOptions(format!(
                "{path}: {:?} is not a number",
                String::from_utf8_lossy(field)
            ))
        })
}

/// Parses the header from the start of a file's bytes.
///
/// `data` need only cover the header itself; anything beyond the blank line
/// is ignored.
pub(crate) fn parse_header(path: &str, data: &[u8]) -> Result<Header> {
    if data.len() < SIGNATURE.len() || !data.starts_with(SIGNATURE) {
        return Err(TesseraError::BadFormatSignature {
            path: path.to_string(),
        });
    }
    let mut pos = SIGNATURE.len();
    let node_ref_lists =
        parse_decimal(path, parse_option_line(path, data, &mut pos, OPTION_NODE_REFS)?)? as usize;
    let key_elements =
        parse_decimal(path, parse_option_line(path, data, &mut pos, OPTION_KEY_ELEMENTS)?)?
            as usize;
    let key_count = parse_decimal(path, parse_option_line(path, data, &mut pos, OPTION_LEN)?)?;
    if key_elements == 0 {
        return Err(TesseraError::BadOptions(format!(
            "{path}: key_elements must be at least 1"
        )));
    }
    if data.get(pos) != Some(&b'\n') {
        return Err(TesseraError::BadIndexData(format!(
            "{path}: missing blank line after header"
        )));
    }
    Ok(Header {
        node_ref_lists,
        key_elements,
        key_count,
        len: pos + 1,
    })
}

/// A decoded node line, references still in byte-offset form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RawNode {
    pub key: Key,
    pub absent: bool,
    pub ref_offsets: SmallVec<[Vec<u64>; 2]>,
    pub value: Bytes,
}

/// Decodes one node line (without its trailing newline).
///
/// Reference offsets accept leading zeros, so both natural and zero-padded
/// renderings parse.
pub(crate) fn parse_node_line(
    path: &str,
    line: &[u8],
    key_elements: usize,
    node_ref_lists: usize,
) -> Result<RawNode> {
    let fields: Vec<&[u8]> = line.split(|b| *b == 0).collect();
    if fields.len() != key_elements + 3 {
        return Err(TesseraError::BadIndexData(format!(
            "{path}: node line has {} fields, expected {}",
            fields.len(),
            key_elements + 3
        )));
    }
    let key = Key::new(fields[..key_elements].iter().map(|e| Bytes::copy_from_slice(e)));
    let absent_field = fields[key_elements];
    let refs_field = fields[key_elements + 1];
    let value_field = fields[key_elements + 2];
    let absent = match absent_field {
        b"" => false,
        [ABSENT_MARKER] => true,
        _ => {
            return Err(TesseraError::BadIndexData(format!(
                "{path}: bad absent marker in line for {key:?}"
            )));
        }
    };
    let mut ref_offsets: SmallVec<[Vec<u64>; 2]> = SmallVec::new();
    if !absent && node_ref_lists > 0 {
        for list in refs_field.split(|b| *b == LIST_SEP) {
            let mut offsets = Vec::new();
            for reference in list.split(|b| *b == REF_SEP) {
                if reference.is_empty() {
                    continue;
                }
                let offset = std::str::from_utf8(reference)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| {
                        TesseraError::BadIndexData(format!(
                            "{path}: unparsable reference in line for {key:?}"
                        ))
                    })?;
                offsets.push(offset);
            }
            ref_offsets.push(offsets);
        }
        if ref_offsets.len() != node_ref_lists {
            return Err(TesseraError::BadIndexData(format!(
                "{path}: line for {key:?} has {} reference lists, expected {node_ref_lists}",
                ref_offsets.len()
            )));
        }
    } else if !absent && !refs_field.is_empty() {
        return Err(TesseraError::BadIndexData(format!(
            "{path}: unexpected reference data in line for {key:?}"
        )));
    }
    Ok(RawNode {
        key,
        absent,
        ref_offsets,
        value: Bytes::copy_from_slice(value_field),
    })
}
