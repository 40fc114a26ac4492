//! Line framing and response formatting.

use bytes::{BufMut, BytesMut};

/// Line terminator.
pub const DELIMITER: u8 = b'\n';

/// Find the end of the first complete line in `input`.
///
/// Scanning starts at `from`, which lets callers skip bytes already known to
/// contain no delimiter. Returns the length of the line including its
/// delimiter.
pub fn find_line(input: &[u8], from: usize) -> Option<usize> {
    input
        .get(from..)?
        .iter()
        .position(|&b| b == DELIMITER)
        .map(|pos| from + pos + 1)
}

/// Append `<prefix> <line>` to `output`.
///
/// `line` is copied as-is, delimiter included.
pub fn write_response(prefix: &str, line: &[u8], output: &mut BytesMut) {
    output.reserve(prefix.len() + 1 + line.len());
    output.put_slice(prefix.as_bytes());
    output.put_u8(b' ');
    output.put_slice(line);
}
