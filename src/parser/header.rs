//! RFC 5322 header blocks: locating, unfolding, and rewriting fields.

/// Find the byte offset where headers end (position of the first blank line).
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some(i);
        }
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some(i);
        }
    }
    None
}

/// Split a raw message into its header block and body.
///
/// The header block keeps its final line break; the body starts after the
/// blank separator line. A message without a blank line is all headers.
pub fn split_message(data: &[u8]) -> (&[u8], &[u8]) {
    match find_header_end(data) {
        Some(end) => {
            let sep = if data[end..].starts_with(b"\r\n\r\n") { 4 } else { 2 };
            // Keep one line break on the header side.
            let keep = sep / 2;
            (&data[..end + keep], &data[end + sep..])
        }
        None => (data, &[]),
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Get the first value for a header name (case-insensitive).
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Split a block of `Name: value` groups separated by blank lines, as found
/// in a `message/delivery-status` body.
pub fn field_groups(text: &str) -> Vec<Vec<(String, String)>> {
    let text = text.replace("\r\n", "\n");
    let mut groups = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                groups.push(unfold_headers(&current));
                current.clear();
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        groups.push(unfold_headers(&current));
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// Raw lines of a header block grouped per field (folded lines stay
/// attached to their field).
pub fn raw_fields(block: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for line in block.split_inclusive('\n') {
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        match fields.last_mut() {
            Some(last) if is_continuation => last.push_str(line),
            _ => fields.push(line.to_string()),
        }
    }
    fields
}

/// Name of a raw field line, if it has one.
pub fn field_name(field: &str) -> Option<&str> {
    field
        .split_once(':')
        .map(|(name, _)| name.trim())
        .filter(|name| !name.is_empty() && !name.contains(' '))
}
