//! `Set-Cookie` to `Cookie` conversion.
//!
//! Several cookies may arrive folded into one comma-joined value, and their
//! attributes (`Expires=Wed, 21 Oct 2015 ...`) can contain commas too, so the
//! value is scanned for comma boundaries that start a new `name=` pair.

/// Cookie attributes that never start a new cookie even when they look like `name=`.
const ATTRIBUTE_NAMES: &[&str] = &[
    "path",
    "domain",
    "expires",
    "max-age",
    "secure",
    "httponly",
    "samesite",
    "priority",
    "partitioned",
];

/// Reduce a `Set-Cookie` value to a `Cookie` request header value.
///
/// Returns the leading `name=value` of every cookie joined with `"; "`,
/// or an empty string when nothing usable is present.
pub fn extract(set_cookie: Option<&str>) -> String {
    let Some(raw) = set_cookie else {
        return String::new();
    };

    split_cookies(raw)
        .into_iter()
        .filter_map(leading_pair)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Split a folded `Set-Cookie` value into one fragment per cookie.
fn split_cookies(raw: &str) -> Vec<&str> {
    let mut fragments = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;

    for (i, b) in raw.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes && starts_new_cookie(&raw[i + 1..]) => {
                fragments.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    fragments.push(&raw[start..]);
    fragments
}

/// Whether `rest` (text after a comma) opens with `token=` for a token that
/// is not a cookie attribute name.
fn starts_new_cookie(rest: &str) -> bool {
    let rest = rest.trim_start();
    let name_len = token_len(rest);
    if name_len == 0 || !rest[name_len..].starts_with('=') {
        return false;
    }
    let name = &rest[..name_len];
    !ATTRIBUTE_NAMES
        .iter()
        .any(|attr| attr.eq_ignore_ascii_case(name))
}

fn token_len(s: &str) -> usize {
    s.find(|c: char| c == '=' || c == ';' || c == ',' || c.is_whitespace())
        .unwrap_or(s.len())
}

/// Pull the leading `name=value` out of one cookie fragment.
fn leading_pair(fragment: &str) -> Option<String> {
    let fragment = fragment.trim();
    let name_len = token_len(fragment);
    if name_len == 0 || !fragment[name_len..].starts_with('=') {
        return None;
    }

    let name = &fragment[..name_len];
    let rest = &fragment[name_len + 1..];

    // Value runs to the first `;` outside double quotes
    let mut in_quotes = false;
    let mut end = rest.len();
    for (i, b) in rest.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b';' if !in_quotes => {
                end = i;
                break;
            }
            _ => {}
        }
    }

    let value = rest[..end].trim_end();
    if value.is_empty() {
        return None;
    }
    Some(format!("{name}={value}"))
}
