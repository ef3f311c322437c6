//! Just enough XML to read the flat documents returned by S3-style and STS APIs.
//!
//! These responses never nest an element inside one of the same name, so a
//! tag scan is sufficient: no attributes, namespaces or CDATA are interpreted.

/// Return the text of every `<tag>...</tag>` element, in document order.
pub fn tag_values(document: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut values = Vec::new();
    let mut rest = document;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

/// Return the text of the first `<tag>...</tag>` element.
pub fn tag_value(document: &str, tag: &str) -> Option<String> {
    tag_values(document, tag).into_iter().next()
}

/// Escape text for inclusion as element content.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
