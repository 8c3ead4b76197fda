//! Request template instantiation helpers.
//!
//! Keyword substitution is plain text replacement: every occurrence of a
//! keyword is replaced, keywords are opaque strings and nothing is escaped.

use std::collections::HashMap;

/// Replaced by the host part of the prepared URL
pub const HOST_KEYWORD: &str = "{HOST}";
/// Replaced by the full authority (`host` or `host:port`) of the prepared URL
pub const HOSTPORT_KEYWORD: &str = "{HOSTPORT}";
/// Replaced by the explicit port, or `443`/`80` when the URL has none
pub const PORT_KEYWORD: &str = "{PORT}";

/// Host and port derived from a prepared URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPort {
    /// The URL parsed; placeholders can be resolved
    Parsed {
        host: String,
        port: String,
        /// Authority exactly as written in the URL, minus any userinfo
        authority: String,
    },
    /// The URL did not parse; placeholders stay as they are
    Unresolved,
}

/// Canonical MIME form of a header name: the first letter and any letter
/// following a hyphen are upper-cased, the rest lower-cased.
///
/// Names containing bytes that are not valid in a header token (spaces,
/// separators, control or non-ASCII bytes) are returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }

    let mut upper = true;
    name.bytes()
        .map(|b| {
            let c = if upper {
                b.to_ascii_uppercase()
            } else {
                b.to_ascii_lowercase()
            };
            upper = b == b'-';
            c as char
        })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

/// Remove control and invisible formatting characters
pub fn clean_control_chars(s: &str) -> String {
    s.chars().filter(|c| !is_non_graphic(*c)).collect()
}

fn is_non_graphic(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '\u{200B}'..='\u{200F}'
                | '\u{2028}'..='\u{202E}'
                | '\u{2060}'..='\u{2064}'
                | '\u{FEFF}'
        )
}

/// Byte-level replacement of every non-overlapping occurrence of `needle`
pub fn replace_bytes(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Substitute keywords into header names and values, then canonicalize the names.
///
/// All substitutions are applied before canonicalizing so that a keyword in a
/// lower-case name is still found after an earlier keyword was replaced. When
/// two names collapse to the same canonical name the one visited last wins;
/// visiting order follows the map and is unspecified.
pub fn substitute_headers(
    headers: &HashMap<String, String>,
    input: &HashMap<String, Vec<u8>>,
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        let mut name = name.clone();
        let mut value = value.clone();
        for (keyword, item) in input {
            if keyword.is_empty() {
                continue;
            }
            let item = String::from_utf8_lossy(item);
            name = name.replace(keyword.as_str(), &item);
            value = value.replace(keyword.as_str(), &item);
        }
        out.insert(canonical_header_key(&name), value);
    }
    out
}

/// Remove the reserved placeholders so they cannot confuse URL parsing
fn strip_reserved(url: &str) -> String {
    url.replace(HOST_KEYWORD, "")
        .replace(PORT_KEYWORD, "")
        .replace(HOSTPORT_KEYWORD, "")
}

/// Derive host and port from a URL that already had user keywords substituted.
///
/// The implicit port is chosen from the URL as given, so a URL starting with
/// `https` resolves `{PORT}` to `443` and anything else to `80`.
pub fn derive_host_port(url: &str) -> HostPort {
    let working = clean_control_chars(&strip_reserved(url));
    let authority = match authority_of(&working) {
        Some(authority) => authority,
        None => {
            log::trace!("Leaving host placeholders unresolved for unparseable URL {:?}", url);
            return HostPort::Unresolved;
        }
    };

    let (host, port) = match split_host_port(&authority) {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => {
            let port = if url.starts_with("https") { "443" } else { "80" };
            (authority.clone(), port.to_string())
        }
    };

    HostPort::Parsed {
        host,
        port,
        authority,
    }
}

/// Authority component as written, without userinfo.
///
/// A scheme is a letter followed by letters, digits, `+`, `-` or `.` up to the
/// first `:`. Without a `//` after it (or at the start of a scheme-less URL)
/// the authority is empty. Returns `None` when the URL is malformed: a leading
/// `:`, a colon in the first segment of a scheme-less path, or an authority
/// with invalid characters or a non-numeric port. Port range is not checked.
fn authority_of(url: &str) -> Option<String> {
    let url = url.split('#').next().unwrap_or(url);
    let rest = match split_scheme(url)? {
        Some(rest) => rest,
        None => {
            let path = url.split('?').next().unwrap_or(url);
            let first_segment = path.split('/').next().unwrap_or(path);
            if !path.starts_with('/') && first_segment.contains(':') {
                return None;
            }
            if url.starts_with("///") {
                return Some(String::new());
            }
            url
        }
    };

    let rest = match rest.strip_prefix("//") {
        Some(rest) => rest,
        None => return Some(String::new()),
    };
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..end];
    if !valid_authority(authority) {
        return None;
    }

    let authority = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };
    Some(authority.to_string())
}

/// `Some(Some(rest))` after a scheme, `Some(None)` without one, `None` for a
/// URL starting with `:`
fn split_scheme(url: &str) -> Option<Option<&str>> {
    for (i, b) in url.bytes().enumerate() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' => {}
            b'0'..=b'9' | b'+' | b'-' | b'.' if i > 0 => {}
            b':' if i == 0 => return None,
            b':' => return Some(Some(&url[i + 1..])),
            _ => return Some(None),
        }
    }
    Some(None)
}

fn valid_authority(authority: &str) -> bool {
    let (userinfo, hostport) = match authority.rfind('@') {
        Some(at) => (&authority[..at], &authority[at + 1..]),
        None => ("", authority),
    };
    let userinfo_ok = userinfo
        .bytes()
        .all(|b| b >= 0x80 || b.is_ascii_alphanumeric() || b"-._:~!$&'()*+,;=%@".contains(&b));
    if !userinfo_ok {
        return false;
    }

    let (host, port) = if let Some(inner) = hostport.strip_prefix('[') {
        match inner.find(']') {
            Some(close) => (&inner[..close], &inner[close + 1..]),
            None => return false,
        }
    } else {
        match hostport.rfind(':') {
            Some(colon) => (&hostport[..colon], &hostport[colon..]),
            None => (hostport, ""),
        }
    };
    let port_ok = port.is_empty()
        || port
            .strip_prefix(':')
            .is_some_and(|digits| digits.bytes().all(|b| b.is_ascii_digit()));

    port_ok && valid_host(host)
}

fn valid_host(host: &str) -> bool {
    let bytes = host.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let escaped = bytes.get(i + 1..i + 3);
            if !escaped.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                return false;
            }
            i += 3;
            continue;
        }
        if !(b >= 0x80 || b.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:[]<>\"".contains(&b)) {
            return false;
        }
        i += 1;
    }
    true
}

/// Split `host:port`, keeping bracketed IPv6 literals intact
fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if authority.starts_with('[') {
        let close = authority.find(']')?;
        let port = authority[close + 1..].strip_prefix(':')?;
        return Some((&authority[..=close], port));
    }
    let (host, rest) = authority.split_once(':')?;
    let port = rest.split(':').next().unwrap_or(rest);
    Some((host, port))
}

/// Replace the reserved placeholders in a string
pub fn resolve_reserved(target: &str, host: &str, authority: &str, port: &str) -> String {
    target
        .replace(HOST_KEYWORD, host)
        .replace(HOSTPORT_KEYWORD, authority)
        .replace(PORT_KEYWORD, port)
}

/// Replace the reserved placeholders in a byte body
pub fn resolve_reserved_bytes(target: &[u8], host: &str, authority: &str, port: &str) -> Vec<u8> {
    let out = replace_bytes(target, HOST_KEYWORD.as_bytes(), host.as_bytes());
    let out = replace_bytes(&out, HOSTPORT_KEYWORD.as_bytes(), authority.as_bytes());
    replace_bytes(&out, PORT_KEYWORD.as_bytes(), port.as_bytes())
}
