//! line-at-a-time parsing of the status line and header lines curl's header
//! callback hands us one at a time (curl merges continuation lines itself).

use http::{HeaderName, HeaderValue, StatusCode, Version};

/// parse a `HTTP/x.y NNN reason` status line. returns `None` for anything else,
/// including header lines and the blank line that ends a header block.
pub(crate) fn parse_status_line(line: &[u8]) -> Option<(Version, StatusCode)> {
    let line = trim_crlf(line);
    let mut parts = line.splitn(3, |&b| b == b' ');

    let proto = parts.next()?;
    let version = match proto {
        b"HTTP/1.0" => Version::HTTP_10,
        b"HTTP/1.1" => Version::HTTP_11,
        b"HTTP/2" | b"HTTP/2.0" => Version::HTTP_2,
        b"HTTP/3" | b"HTTP/3.0" => Version::HTTP_3,
        _ => return None,
    };

    let code = parts.next()?;
    let code = std::str::from_utf8(code).ok()?;
    let status = StatusCode::from_bytes(code.as_bytes()).ok()?;

    Some((version, status))
}

/// parse a `Name: value` header line.
pub(crate) fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
    let line = trim_crlf(line);
    let colon = line.iter().position(|&b| b == b':')?;
    let (name, value) = line.split_at(colon);
    let value = &value[1..];
    let value = trim_ows(value);

    let name = HeaderName::from_bytes(name).ok()?;
    let value = HeaderValue::from_bytes(value).ok()?;
    Some((name, value))
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line() {
        let (version, status) = parse_status_line(b"HTTP/1.1 200 OK\r\n").unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn header_line() {
        let (name, value) = parse_header_line(b"Content-Type:  text/plain \r\n").unwrap();
        assert_eq!(name, "content-type");
        assert_eq!(value, "text/plain");
    }

    #[test]
    fn non_status_non_header_is_none() {
        assert!(parse_status_line(b"Content-Type: text/plain\r\n").is_none());
        assert!(parse_header_line(b"HTTP/1.1 200 OK\r\n").is_none());
    }
}
