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

//! PAC result resolution.
//!
//! A PAC script's `FindProxyForURL` returns a string such as
//! `"PROXY 10.0.0.1:3128; SOCKS5 10.0.0.2; DIRECT"`. [`resolve`] turns
//! that string into a single [`ProxyRule`]: the first usable directive.
//! Later directives are not tried as failover by the gateway; callers
//! that want failover iterate [`parse_pac_rules`] themselves and issue a
//! new request per candidate.

use crate::error::{Error, Result};
use crate::util::split_host_port;
use std::fmt;

pub const DEFAULT_HTTP_PROXY_PORT: u16 = 8080;
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    Direct,
    Proxy,
    Http,
    Socks,
    Socks4,
    Socks5,
    /// A keyword this resolver does not know, kept verbatim.
    Unknown(String),
}

impl ProxyKind {
    /// Keywords are matched exactly as PAC scripts spell them, in upper case.
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "DIRECT" => ProxyKind::Direct,
            "PROXY" => ProxyKind::Proxy,
            "HTTP" => ProxyKind::Http,
            "SOCKS" => ProxyKind::Socks,
            "SOCKS4" => ProxyKind::Socks4,
            "SOCKS5" => ProxyKind::Socks5,
            _ => ProxyKind::Unknown(keyword.to_string()),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProxyKind::Socks | ProxyKind::Socks4 | ProxyKind::Socks5 => DEFAULT_SOCKS_PORT,
            _ => DEFAULT_HTTP_PROXY_PORT,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyKind::Direct => write!(f, "DIRECT"),
            ProxyKind::Proxy => write!(f, "PROXY"),
            ProxyKind::Http => write!(f, "HTTP"),
            ProxyKind::Socks => write!(f, "SOCKS"),
            ProxyKind::Socks4 => write!(f, "SOCKS4"),
            ProxyKind::Socks5 => write!(f, "SOCKS5"),
            ProxyKind::Unknown(keyword) => write!(f, "{}", keyword),
        }
    }
}

/// One routing decision taken from a PAC result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    pub kind: ProxyKind,
    /// Empty for `DIRECT`.
    pub host: String,
    /// Zero for `DIRECT`.
    pub port: u16,
}

impl ProxyRule {
    pub fn direct() -> Self {
        ProxyRule { kind: ProxyKind::Direct, host: String::new(), port: 0 }
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ProxyKind::Direct
    }

    /// `PROXY` and `HTTP` directives name an HTTP proxy this gateway can chain through.
    pub fn is_http_proxy(&self) -> bool {
        matches!(self.kind, ProxyKind::Proxy | ProxyKind::Http)
    }
}

impl fmt::Display for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_direct() {
            write!(f, "DIRECT")
        } else {
            write!(f, "{} {}:{}", self.kind, self.host, self.port)
        }
    }
}

/// Parse one `;`-separated token. `None` means the token is not usable.
fn parse_directive(token: &str) -> Option<ProxyRule> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let Some((keyword, rest)) = token.split_once(|c: char| c.is_ascii_whitespace()) else {
        // Bare keyword: only DIRECT means something on its own.
        return match ProxyKind::from_keyword(token) {
            ProxyKind::Direct => Some(ProxyRule::direct()),
            _ => None,
        };
    };
    let kind = ProxyKind::from_keyword(keyword);
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    let (host, port) = split_host_port(rest, kind.default_port()).ok()?;
    Some(ProxyRule { kind, host, port })
}

/// Resolve a PAC result string to its first usable directive.
///
/// Fails only when the string is empty or holds no usable directive.
pub fn resolve(pac_result: &str) -> Result<ProxyRule> {
    pac_result.split(';').find_map(parse_directive).ok_or(Error::MalformedPacResult)
}

/// Every usable directive of a PAC result string, in order.
pub fn parse_pac_rules(pac_result: &str) -> Vec<ProxyRule> {
    pac_result.split(';').filter_map(parse_directive).collect()
}

/// The capability that maps a request to a PAC result string.
///
/// This is the seam where a real PAC script engine, or a test stub,
/// plugs into the gateway. Closures `Fn(&str, &str) -> String` are
/// resolvers too.
pub trait PacResolver: Send + Sync {
    /// The `FindProxyForURL(url, host)` result for a request.
    fn find_proxy_for_url(&self, url: &str, host: &str) -> String;
}

impl<F> PacResolver for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn find_proxy_for_url(&self, url: &str, host: &str) -> String {
        self(url, host)
    }
}

/// A resolver that answers every request with the same PAC result.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    result: String,
}

impl StaticResolver {
    pub fn new(result: impl Into<String>) -> Self {
        StaticResolver { result: result.into() }
    }
}

impl PacResolver for StaticResolver {
    fn find_proxy_for_url(&self, _url: &str, _host: &str) -> String {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: ProxyKind, host: &str, port: u16) -> ProxyRule {
        ProxyRule { kind, host: host.to_string(), port }
    }

    #[test]
    fn resolve_direct() {
        let result = resolve("DIRECT").unwrap();
        assert_eq!(result.kind, ProxyKind::Direct);
        assert!(result.host.is_empty());
    }

    #[test]
    fn resolve_proxy_with_port() {
        assert_eq!(
            resolve("PROXY 127.0.0.1:9000").unwrap(),
            rule(ProxyKind::Proxy, "127.0.0.1", 9000)
        );
    }

    #[test]
    fn resolve_default_ports() {
        let data = [
            ("PROXY proxy.example", rule(ProxyKind::Proxy, "proxy.example", 8080)),
            ("HTTP proxy.example", rule(ProxyKind::Http, "proxy.example", 8080)),
            ("SOCKS 10.0.0.1", rule(ProxyKind::Socks, "10.0.0.1", 1080)),
            ("SOCKS4 10.0.0.1", rule(ProxyKind::Socks4, "10.0.0.1", 1080)),
            ("SOCKS5 10.0.0.1", rule(ProxyKind::Socks5, "10.0.0.1", 1080)),
            (
                "HTTPS secure.example",
                rule(ProxyKind::Unknown("HTTPS".into()), "secure.example", 8080),
            ),
        ];
        for (input, expected) in data {
            assert_eq!(resolve(input).unwrap(), expected, "For input: {}", input);
        }
    }

    #[test]
    fn resolve_honors_only_first_directive() {
        let result = resolve("PROXY 127.0.0.1:9000;PROXY 127.0.0.1:9001; DIRECT").unwrap();
        assert_eq!(result, rule(ProxyKind::Proxy, "127.0.0.1", 9000));
    }

    #[test]
    fn resolve_skips_unusable_tokens() {
        assert_eq!(resolve(" ; ;DIRECT").unwrap(), ProxyRule::direct());
        assert_eq!(
            resolve("BOGUS; PROXY a.example:1").unwrap(),
            rule(ProxyKind::Proxy, "a.example", 1)
        );
        assert_eq!(resolve("PROXY a.example:bad; DIRECT").unwrap(), ProxyRule::direct());
        assert_eq!(
            resolve("\tPROXY   b.example:3128  ").unwrap(),
            rule(ProxyKind::Proxy, "b.example", 3128)
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert!(matches!(resolve("direct"), Err(Error::MalformedPacResult)));
        assert_eq!(
            resolve("proxy h.example:1").unwrap(),
            rule(ProxyKind::Unknown("proxy".into()), "h.example", 1)
        );
        assert_eq!(resolve("direct; DIRECT").unwrap(), ProxyRule::direct());
    }

    #[test]
    fn resolve_failures() {
        assert!(matches!(resolve(""), Err(Error::MalformedPacResult)));
        assert!(matches!(resolve(";;  ;"), Err(Error::MalformedPacResult)));
        assert!(matches!(resolve("PROXY"), Err(Error::MalformedPacResult)));
        assert!(matches!(resolve("NOPE"), Err(Error::MalformedPacResult)));
    }

    #[test]
    fn parse_all_rules() {
        let rules = parse_pac_rules("PROXY 127.0.0.1:9000;PROXY 127.0.0.1:9001; DIRECT");
        assert_eq!(
            rules,
            vec![
                rule(ProxyKind::Proxy, "127.0.0.1", 9000),
                rule(ProxyKind::Proxy, "127.0.0.1", 9001),
                ProxyRule::direct(),
            ]
        );
        assert!(parse_pac_rules("").is_empty());
    }

    #[test]
    fn rule_display() {
        assert_eq!(ProxyRule::direct().to_string(), "DIRECT");
        assert_eq!(rule(ProxyKind::Socks5, "h", 1080).to_string(), "SOCKS5 h:1080");
    }

    #[test]
    fn resolvers() {
        let closure = |url: &str, host: &str| format!("PROXY {}:1 ; {}", host, url.len());
        assert_eq!(closure.find_proxy_for_url("http://a/", "a"), "PROXY a:1 ; 9");
        let fixed = StaticResolver::new("DIRECT");
        assert_eq!(fixed.find_proxy_for_url("http://a/", "a"), "DIRECT");
        let boxed: Box<dyn PacResolver> = Box::new(fixed);
        assert_eq!(boxed.find_proxy_for_url("", ""), "DIRECT");
    }
}
