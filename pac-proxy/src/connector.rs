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

use crate::error::{Error, Result};
use crate::pac::ProxyRule;
use crate::request::{add_header, find, read_message_head};
use crate::stats::ByteCounter;
use base64::{engine::general_purpose, Engine as _};
use log::{debug, info, warn};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const HTTP_VERSION: &str = "1.1";

/// Header added to forwarded plain HTTP requests, naming the gateway port.
pub const PROXY_PORT_HEADER: &str = "Proxy-Port";

/// Which flow a client request takes through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// `CONNECT`: an opaque tunnel is opened to the target.
    Tunnel,
    /// Any other method: the request is relayed once.
    Http,
}

/// An outbound connection ready for relaying.
pub struct Upstream {
    pub stream: TcpStream,
    /// Bytes the upstream sent after its CONNECT response header; they
    /// belong to the tunnel and must reach the client first.
    pub pending: Vec<u8>,
}

/// Opens the server-facing side of a client connection, directly or
/// through an upstream HTTP proxy.
///
/// For upstream `CONNECT` the handshake includes optional Basic
/// authentication.
#[derive(Clone)]
pub struct Connector {
    gateway_port: u16,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
}

impl Connector {
    pub fn new(
        gateway_port: u16,
        timeout: Duration,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Connector { gateway_port, timeout, username, password }
    }

    /// Open the outbound path for `host:port` as decided by `rule`.
    ///
    /// `request` is the client's raw request (header and any early
    /// body bytes); it is only used by the `Http` flow.
    pub fn open(
        &self,
        rule: &ProxyRule,
        host: &str,
        port: u16,
        flow: Flow,
        request: &[u8],
        stats: &dyn ByteCounter,
    ) -> Result<Upstream> {
        if rule.is_http_proxy() {
            return match flow {
                Flow::Tunnel => self.connect_via_proxy_https(host, port, rule, stats),
                Flow::Http => self.connect_via_proxy_http(request, rule, stats),
            };
        }
        if !rule.is_direct() {
            info!("{} is not supported, connecting {}:{} directly", rule, host, port);
        }
        match flow {
            Flow::Tunnel => {
                Ok(Upstream { stream: self.connect_direct(host, port)?, pending: Vec::new() })
            }
            Flow::Http => {
                let mut stream = self.connect_direct(host, port)?;
                self.send_request(&mut stream, request, stats)?;
                Ok(Upstream { stream, pending: Vec::new() })
            }
        }
    }

    /// Connect to `host:port` with send and receive timeouts applied.
    ///
    /// DNS, socket and connect failures all collapse into `Unreachable`.
    pub fn connect_direct(&self, host: &str, port: u16) -> Result<TcpStream> {
        let unreachable = || Error::Unreachable { host: host.to_string(), port };
        let addrs = (host, port).to_socket_addrs().map_err(|e| {
            warn!("Cannot resolve {}: {}", host, e);
            unreachable()
        })?;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(e) => debug!("connect to {} failed: {}", addr, e),
            }
        }
        warn!("Cannot connect to {}:{}", host, port);
        Err(unreachable())
    }

    /// Relay a plain HTTP request through an upstream proxy. The request
    /// line is not rewritten.
    pub fn connect_via_proxy_http(
        &self,
        request: &[u8],
        proxy: &ProxyRule,
        stats: &dyn ByteCounter,
    ) -> Result<Upstream> {
        let mut stream = self.connect_direct(&proxy.host, proxy.port)?;
        self.send_request(&mut stream, request, stats)?;
        Ok(Upstream { stream, pending: Vec::new() })
    }

    /// Ask an upstream proxy to open a tunnel to `host:port`.
    pub fn connect_via_proxy_https(
        &self,
        host: &str,
        port: u16,
        proxy: &ProxyRule,
        stats: &dyn ByteCounter,
    ) -> Result<Upstream> {
        let mut stream = self.connect_direct(&proxy.host, proxy.port)?;

        let request = self.connect_request(host, port);
        stream.write_all(request.as_bytes())?;
        stats.add_sent(request.len());

        let response = read_message_head(&mut stream, stats).map_err(|e| {
            warn!("No CONNECT response from {}:{}: {}", proxy.host, proxy.port, e);
            match e {
                Error::HeaderTooLarge => e,
                _ => Error::UpstreamRejected { status: "empty response".to_string() },
            }
        })?;
        let header = response.header();
        if !is_connect_success(header.as_bytes()) {
            let status = header.lines().next().unwrap_or_default().to_string();
            warn!("Upstream proxy {}:{} rejected CONNECT: {}", proxy.host, proxy.port, status);
            return Err(Error::UpstreamRejected { status });
        }
        Ok(Upstream { stream, pending: response.trailing().to_vec() })
    }

    fn connect_request(&self, host: &str, port: u16) -> String {
        let authority = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let mut request = format!("CONNECT {} HTTP/{}\r\n", authority, HTTP_VERSION);
        request.push_str(&format!("Host: {}\r\n", authority));
        request.push_str("Proxy-Connection: Keep-Alive\r\n");

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            let encoded_auth = base64_encode(format!("{}:{}", username, password).as_bytes());
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                String::from_utf8_lossy(&encoded_auth)
            ));
        }

        request.push_str("\r\n");
        request
    }

    /// Send a client request upstream with the gateway's `Proxy-Port`
    /// header added.
    fn send_request(
        &self,
        stream: &mut TcpStream,
        request: &[u8],
        stats: &dyn ByteCounter,
    ) -> Result<()> {
        let (header, body) = match find(request, b"\r\n\r\n") {
            Some(pos) => request.split_at(pos + 4),
            None => (request, &[][..]),
        };
        let header = add_header(
            &String::from_utf8_lossy(header),
            PROXY_PORT_HEADER,
            &self.gateway_port.to_string(),
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(body)?;
        stats.add_sent(header.len() + body.len());
        Ok(())
    }
}

/// Whether `header` is a complete `HTTP/1.1 200` response.
fn is_connect_success(header: &[u8]) -> bool {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(header) {
        Ok(status) if status.is_complete() => {
            response.version == Some(1) && response.code == Some(200)
        }
        _ => false,
    }
}

fn base64_encode(src: &[u8]) -> Vec<u8> {
    general_purpose::STANDARD.encode(src).into_bytes()
}
