// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request header parsing for the gateway.
//!
//! The parsers here only understand as much of an HTTP/1.x request
//! header as routing needs: the method, the request target and the
//! `Host` header. They do not validate the rest of the header and
//! never rewrite it, except for [`add_header`].

use crate::error::{Error, Result};
use crate::stats::ByteCounter;
use crate::util::split_host_port;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use std::borrow::Cow;
use std::io::{self, Read};
use std::sync::OnceLock;

pub const MAX_HEADER_SIZE: usize = 8192;
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

const HEADER_END: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 4096;

/// The bytes of a request or response up to and including the blank
/// line, plus whatever arrived in the same reads after it.
#[derive(Debug, Clone)]
pub struct MessageHead {
    raw: Bytes,
    header_len: usize,
}

impl MessageHead {
    pub fn header(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw[..self.header_len])
    }

    /// Bytes the client sent after the header terminator.
    pub fn trailing(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Read a message header (request from a client, or response from an
/// upstream proxy) from `reader`.
///
/// Stops at the first `\r\n\r\n`. Fails with `HeaderTooLarge` once more
/// than [`MAX_HEADER_SIZE`] bytes arrived without a terminator, and with
/// `UnexpectedEof` if the peer closes first.
pub fn read_message_head<R: Read>(
    reader: &mut R,
    stats: &dyn ByteCounter,
) -> Result<MessageHead> {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before end of header",
                )
                .into())
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        stats.add_received(n);
        // The terminator may straddle two reads.
        let search_from = buffer.len().saturating_sub(HEADER_END.len() - 1);
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buffer[search_from..], HEADER_END) {
            let header_len = search_from + pos + HEADER_END.len();
            return Ok(MessageHead { raw: buffer.freeze(), header_len });
        }
        if buffer.len() > MAX_HEADER_SIZE {
            return Err(Error::HeaderTooLarge);
        }
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// The token before the first space, or `""` when there is none.
pub fn request_method(header: &str) -> &str {
    header.split_once(' ').map_or("", |(method, _)| method)
}

/// The request target: the token after the method.
fn request_target(header: &str) -> Result<&str> {
    let (_, rest) = header
        .split_once(' ')
        .ok_or_else(|| Error::MalformedRequest("missing request target".to_string()))?;
    let target = rest.split(|c: char| c.is_ascii_whitespace()).next().unwrap_or("");
    if target.is_empty() {
        return Err(Error::MalformedRequest("empty request target".to_string()));
    }
    Ok(target)
}

/// Extract `host` and `port` from `CONNECT host[:port] HTTP/1.1`.
///
/// The port defaults to 443.
pub fn parse_connect_request(header: &str) -> Result<(String, u16)> {
    let target = request_target(header)?;
    split_host_port(target, DEFAULT_HTTPS_PORT)
}

fn host_header_regex() -> &'static Regex {
    static HOST: OnceLock<Regex> = OnceLock::new();
    HOST.get_or_init(|| {
        Regex::new(r"(?im)^host:[ \t]*(?P<value>[^\r\n]*?)[ \t]*\r?$").expect("valid Host regex")
    })
}

/// Extract `host` and `port` from the `Host:` header of a plain HTTP
/// request. The port defaults to 80.
pub fn parse_http_request(header: &str) -> Result<(String, u16)> {
    let value = host_header_regex()
        .captures(header)
        .and_then(|caps| caps.name("value"))
        .map(|m| m.as_str())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::MalformedRequest("missing Host header".to_string()))?;
    split_host_port(value, DEFAULT_HTTP_PORT)
}

/// Build the URL handed to the PAC resolver.
///
/// * `CONNECT host:port` becomes `https://host:port`.
/// * An absolute-form target (`http://...`) is returned as is.
/// * An origin-form target (`/path`) is joined with the `Host` header.
pub fn request_url(header: &str) -> Result<String> {
    if request_method(header) == "CONNECT" {
        let (host, port) = parse_connect_request(header)?;
        return Ok(format!("https://{}:{}", bracket_ipv6(&host), port));
    }
    let target = request_target(header)?;
    if target.contains("://") {
        return Ok(target.to_string());
    }
    let (host, port) = match parse_http_request(header) {
        Ok(host_port) => host_port,
        Err(_) => return Ok(target.to_string()),
    };
    let mut url = format!("http://{}", bracket_ipv6(&host));
    if port != DEFAULT_HTTP_PORT {
        url.push_str(&format!(":{}", port));
    }
    if !target.starts_with('/') {
        url.push('/');
    }
    url.push_str(target);
    Ok(url)
}

fn bracket_ipv6(host: &str) -> Cow<'_, str> {
    if host.contains(':') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    }
}

/// Append `name: value` as the last header field of `header`.
///
/// Anything after the blank line (an early body) is preserved. A header
/// without a terminator gets the field appended at the end.
pub fn add_header(header: &str, name: &str, value: &str) -> String {
    match header.find("\r\n\r\n") {
        Some(end) => {
            format!("{}\r\n{}: {}{}", &header[..end], name, value, &header[end..])
        }
        None => format!("{}{}: {}\r\n", header, name, value),
    }
}
