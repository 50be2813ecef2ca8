//! Framing helpers for `data:`-prefixed event streams.
//!
//! Chunk boundaries from the network do not line up with event boundaries,
//! so decoders buffer raw text and repeatedly carve complete events off the
//! front. Both blank-line conventions appear in the wild; the earlier
//! boundary wins when a buffer happens to contain each.

/// Terminator payload some dialects send after the last event.
pub(crate) const STREAM_DONE_SENTINEL: &str = "[DONE]";

/// Finds the earliest complete-event boundary, returning the byte index of
/// the delimiter and its length.
pub(crate) fn find_event_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|idx| (idx, 2));
    let crlf = buffer.find("\r\n\r\n").map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Joins the `data:` lines of one framed event, skipping comment lines.
/// Returns `None` when the event carries no data line at all.
pub(crate) fn data_payload(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
