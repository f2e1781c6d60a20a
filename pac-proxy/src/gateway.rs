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

//! The listening side of the proxy: one accept thread feeding a fixed
//! pool of workers through a [`TaskQueue`].

use crate::connector::{Connector, Flow, Upstream};
use crate::error::{Error, Result};
use crate::pac::{self, PacResolver, ProxyRule};
use crate::queue::TaskQueue;
use crate::request::{
    parse_connect_request, parse_http_request, read_message_head, request_method, request_url,
    MessageHead,
};
use crate::stats::{ActiveConnection, ByteCounter, SharedStats, Stats};
use crate::transport::{wait_descriptor, Readiness, Transport};
use crate::tunnel::{self, TunnelEnd};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const LISTEN_BACKLOG: i32 = 128;
/// Worker count used when host concurrency cannot be determined.
const DEFAULT_WORKERS: usize = 4;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listening port. Zero picks an ephemeral port at start.
    pub port: u16,
    pub num_threads: usize,
    /// Connect, send and receive timeout toward targets and upstream proxies.
    pub connect_timeout: Duration,
    /// Receive timeout while reading the client request header.
    pub client_timeout: Duration,
    /// How often blocked loops look at the running flag.
    pub poll_interval: Duration,
    /// Basic credentials for CONNECT requests sent to upstream proxies.
    pub upstream_credentials: Option<(String, String)>,
}

impl GatewayConfig {
    /// A `num_threads` of zero or less means one worker per available CPU.
    pub fn new(port: u16, num_threads: i32) -> Self {
        GatewayConfig {
            port,
            num_threads: worker_count(num_threads),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            upstream_credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.upstream_credentials = Some((username.to_string(), password.to_string()));
        self
    }
}

fn worker_count(requested: i32) -> usize {
    if requested > 0 {
        return requested as usize;
    }
    thread::available_parallelism().map(|n| n.get()).unwrap_or(DEFAULT_WORKERS)
}

/// An accepted client connection waiting for a worker.
///
/// The socket is closed when the task is dropped, whether by the
/// worker that handled it or by `stop` draining the queue.
#[derive(Debug)]
pub struct ClientTask {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// The most recent CONNECT target seen by a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub url: String,
    pub gateway_port: u16,
}

struct Inner {
    config: GatewayConfig,
    running: AtomicBool,
    local_port: AtomicU16,
    queue: TaskQueue<ClientTask>,
    resolver: RwLock<Option<Arc<dyn PacResolver>>>,
    stats: SharedStats,
    last_target: Mutex<Option<TargetRecord>>,
}

/// A forwarding proxy that picks its upstream path per request through
/// an optional [`PacResolver`].
///
/// Without a resolver every request is sent straight to its target.
pub struct Gateway {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let local_port = AtomicU16::new(config.port);
        Gateway {
            inner: Arc::new(Inner {
                config,
                running: AtomicBool::new(false),
                local_port,
                queue: TaskQueue::new(),
                resolver: RwLock::new(None),
                stats: SharedStats::new(),
                last_target: Mutex::new(None),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resolver(self, resolver: impl PacResolver + 'static) -> Self {
        self.set_resolver(resolver);
        self
    }

    /// Install `resolver` for every request accepted from now on. This
    /// may be called while the gateway is running.
    pub fn set_resolver(&self, resolver: impl PacResolver + 'static) {
        let resolver: Arc<dyn PacResolver> = Arc::new(resolver);
        *self.inner.resolver.write().unwrap_or_else(|e| e.into_inner()) = Some(resolver);
    }

    pub fn clear_resolver(&self) {
        *self.inner.resolver.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Listen on the configured port and start serving.
    ///
    /// Fails with `AlreadyRunning` while a previous start is in effect,
    /// and with `Bind` when the listening socket cannot be set up; no
    /// thread is left behind in either case.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let (listener, port) = match bind_listener(self.inner.config.port) {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                error!("{}", e);
                return Err(e);
            }
        };
        self.inner.local_port.store(port, Ordering::Release);
        self.inner.queue.reopen();
        self.reset_stats();

        if let Err(e) = self.spawn_threads(listener) {
            error!("Failed to spawn gateway threads: {}", e);
            self.stop();
            return Err(e.into());
        }
        info!("Gateway listening on port {} with {} workers", port, self.inner.config.num_threads);
        Ok(())
    }

    fn spawn_threads(&self, listener: TcpListener) -> io::Result<()> {
        let mut threads = self.lock_threads();
        for i in 0..self.inner.config.num_threads {
            let inner = self.inner.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("pac_proxy_worker_{}", i))
                    .spawn(move || inner.worker_loop())?,
            );
        }
        let inner = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("pac_proxy_accept".to_string())
                .spawn(move || inner.accept_loop(listener))?,
        );
        Ok(())
    }

    /// Stop serving and wait for every gateway thread to exit.
    ///
    /// Connections still queued are closed unanswered. Calling this on
    /// a gateway that is not running does nothing.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.close();
        let threads = std::mem::take(&mut *self.lock_threads());
        for handle in threads {
            if handle.join().is_err() {
                warn!("A gateway thread panicked");
            }
        }
        let unclaimed = self.inner.queue.drain();
        if !unclaimed.is_empty() {
            debug!("Closing {} unclaimed connections", unclaimed.len());
        }
        info!("Gateway on port {} stopped", self.port());
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The listening port; the bound port once started on port zero.
    pub fn port(&self) -> u16 {
        self.inner.local_port.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.inner.stats()
    }

    /// Replace the counters with fresh ones starting from zero.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn throughput(&self) -> f64 {
        self.stats().throughput()
    }

    pub fn last_target(&self) -> Option<TargetRecord> {
        self.inner.last_target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(port: u16) -> Result<(TcpListener, u16)> {
    let bind_error = |source| Error::Bind { port, source };
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    let listener: TcpListener = socket.into();
    let local_port = listener.local_addr().map_err(bind_error)?.port();
    Ok((listener, local_port))
}

impl Inner {
    fn stats(&self) -> Arc<Stats> {
        self.stats.current()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn accept_loop(&self, listener: TcpListener) {
        let fd = listener.as_raw_fd();
        while self.is_running() {
            match wait_descriptor(fd, self.config.poll_interval) {
                Ok(Readiness::Readable) => {}
                Ok(Readiness::Idle) => continue,
                Ok(Readiness::Closed) => {
                    error!("Listening socket reported an error");
                    thread::sleep(self.config.poll_interval);
                    continue;
                }
                Err(e) => {
                    error!("Failed to wait for connections: {}", e);
                    thread::sleep(self.config.poll_interval);
                    continue;
                }
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("Dropping connection from {}: {}", peer, e);
                        continue;
                    }
                    self.stats().total_connections.fetch_add(1, Ordering::Relaxed);
                    if self.queue.push(ClientTask { stream, peer }).is_err() {
                        debug!("Queue closed, dropping connection from {}", peer);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
        debug!("Accept loop on port {} exiting", self.local_port.load(Ordering::Acquire));
    }

    fn worker_loop(&self) {
        while let Some(task) = self.queue.pop() {
            self.handle_client(task);
        }
    }

    fn handle_client(&self, task: ClientTask) {
        let ClientTask { mut stream, peer } = task;
        // Byte counts follow resets; the active count stays with its snapshot.
        let snapshot = self.stats();
        let _active = ActiveConnection::new(&snapshot);
        let stats: &dyn ByteCounter = &self.stats;
        if let Err(e) = stream.set_read_timeout(Some(self.config.client_timeout)) {
            warn!("Cannot set read timeout for {}: {}", peer, e);
            return;
        }
        let head = match read_message_head(&mut stream, stats) {
            Ok(head) => head,
            Err(e) => {
                debug!("Closing {} without a request: {}", peer, e);
                return;
            }
        };
        let result = if request_method(&head.header()) == "CONNECT" {
            self.handle_connect(&mut stream, &head)
        } else {
            self.handle_http(&mut stream, &head)
        };
        // An error here means nothing has been sent to the client yet.
        if let Err(e) = result {
            let response = if e.is_client_error() { RESPONSE_400 } else { RESPONSE_502 };
            warn!("Request from {} failed: {}", peer, e);
            if stream.write_all(response).is_ok() {
                stats.add_sent(response.len());
            }
        }
    }

    fn handle_connect(&self, client: &mut TcpStream, head: &MessageHead) -> Result<()> {
        let stats: &dyn ByteCounter = &self.stats;
        self.stats().https_requests.fetch_add(1, Ordering::Relaxed);
        let header = head.header();
        let (host, port) = parse_connect_request(&header)?;
        let url = request_url(&header)?;
        debug!("CONNECT {}", url);
        self.record_target(&url);

        let rule = self.route(&url, &host);
        let Upstream { stream: mut server, pending } =
            self.connector().open(&rule, &host, port, Flow::Tunnel, &[], stats)?;

        if let Err(e) = write_all_counted(client, RESPONSE_200_CONNECT, stats)
            .and_then(|_| write_all_counted(client, &pending, stats))
            .and_then(|_| write_all_counted(&mut server, head.trailing(), stats))
        {
            debug!("Tunnel to {} closed before it started: {}", url, e);
            finish_relay(&url, None, client, &mut server);
            return Ok(());
        }
        let poll_interval = self.config.poll_interval;
        let end = tunnel::pump(client, &mut server, &self.running, stats, poll_interval);
        finish_relay(&url, Some(end), client, &mut server);
        Ok(())
    }

    fn handle_http(&self, client: &mut TcpStream, head: &MessageHead) -> Result<()> {
        let stats: &dyn ByteCounter = &self.stats;
        self.stats().http_requests.fetch_add(1, Ordering::Relaxed);
        let header = head.header();
        let (host, port) = parse_http_request(&header)?;
        let url = request_url(&header)?;
        debug!("{} {}", request_method(&header), url);

        let rule = self.route(&url, &host);
        let Upstream { stream: mut server, .. } =
            self.connector().open(&rule, &host, port, Flow::Http, head.raw(), stats)?;
        let end = tunnel::forward_response(
            &mut server,
            client,
            &self.running,
            stats,
            self.config.poll_interval,
            self.config.connect_timeout,
        );
        finish_relay(&url, Some(end), client, &mut server);
        Ok(())
    }

    /// Ask the installed resolver how to reach `url`. A missing resolver,
    /// an empty answer or one with no usable directive means DIRECT.
    fn route(&self, url: &str, host: &str) -> ProxyRule {
        let resolver = self.resolver.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(resolver) = resolver else {
            return ProxyRule::direct();
        };
        let result = resolver.find_proxy_for_url(url, host);
        if result.trim().is_empty() {
            return ProxyRule::direct();
        }
        match pac::resolve(&result) {
            Ok(rule) => {
                info!("{} -> {}", url, rule);
                rule
            }
            Err(e) => {
                warn!("PAC result {:?} for {}: {}, going direct", result, url, e);
                ProxyRule::direct()
            }
        }
    }

    fn connector(&self) -> Connector {
        let (username, password) = match &self.config.upstream_credentials {
            Some((username, password)) => (Some(username.clone()), Some(password.clone())),
            None => (None, None),
        };
        Connector::new(
            self.local_port.load(Ordering::Acquire),
            self.config.connect_timeout,
            username,
            password,
        )
    }

    fn record_target(&self, url: &str) {
        *self.last_target.lock().unwrap_or_else(|e| e.into_inner()) = Some(TargetRecord {
            url: url.to_string(),
            gateway_port: self.local_port.load(Ordering::Acquire),
        });
    }
}

fn write_all_counted<W: Write>(
    writer: &mut W,
    bytes: &[u8],
    stats: &dyn ByteCounter,
) -> io::Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    writer.write_all(bytes)?;
    stats.add_sent(bytes.len());
    Ok(())
}

/// Log how a relay ended and close both of its transports.
fn finish_relay<T: Transport>(url: &str, end: Option<TunnelEnd>, client: &mut T, server: &mut T) {
    match end {
        Some(TunnelEnd::Error(e)) => warn!("Relay for {} failed: {}", url, e),
        Some(TunnelEnd::IdleTimeout) => debug!("Relay for {} timed out", url),
        Some(end) => debug!("Relay for {} finished: {:?}", url, end),
        None => {}
    }
    server.close();
    client.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pac::{ProxyKind, StaticResolver};
    use crate::transport::MemoryTransport;
    use std::io::Read;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::new(0, 2);
        config.poll_interval = Duration::from_millis(50);
        config.connect_timeout = Duration::from_secs(2);
        config.client_timeout = Duration::from_secs(2);
        config
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(3), 3);
        assert!(worker_count(0) >= 1);
        assert!(worker_count(-1) >= 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = GatewayConfig::new(8080, 4).with_credentials("user", "pass");
        assert_eq!(config.port, 8080);
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.client_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.upstream_credentials, Some(("user".to_string(), "pass".to_string())));
    }

    #[test]
    fn test_route_without_resolver_is_direct() {
        let gateway = Gateway::new(test_config());
        assert!(gateway.inner.route("http://example.com/", "example.com").is_direct());
    }

    #[test]
    fn test_route_follows_resolver() {
        let gateway = Gateway::new(test_config())
            .with_resolver(StaticResolver::new("PROXY 127.0.0.1:9000; DIRECT"));
        let rule = gateway.inner.route("https://example.com:443", "example.com");
        assert_eq!(rule.kind, ProxyKind::Proxy);
        assert_eq!(rule.port, 9000);

        gateway.set_resolver(|_: &str, _: &str| "PROXY 127.0.0.1:9001".to_string());
        assert_eq!(gateway.inner.route("https://example.com:443", "example.com").port, 9001);

        gateway.set_resolver(StaticResolver::new("   "));
        assert!(gateway.inner.route("https://example.com:443", "example.com").is_direct());

        gateway.set_resolver(StaticResolver::new("PROXY 127.0.0.1:111111111111 ;"));
        assert!(gateway.inner.route("https://example.com:443", "example.com").is_direct());

        gateway.clear_resolver();
        assert!(gateway.inner.route("https://example.com:443", "example.com").is_direct());
    }

    #[test]
    fn test_start_and_stop() {
        let gateway = Gateway::new(test_config());
        assert!(!gateway.is_running());
        gateway.start().unwrap();
        assert!(gateway.is_running());
        assert_ne!(gateway.port(), 0);
        assert!(matches!(gateway.start(), Err(Error::AlreadyRunning)));

        gateway.stop();
        assert!(!gateway.is_running());
        assert!(gateway.lock_threads().is_empty());
        gateway.stop();
    }

    #[test]
    fn test_malformed_connect_gets_400() {
        let gateway = Gateway::new(test_config());
        gateway.start().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", gateway.port())).unwrap();
        client.write_all(b"CONNECT  HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, RESPONSE_400);
        assert_eq!(gateway.stats().https_requests(), 1);
        assert_eq!(gateway.last_target(), None);
        gateway.stop();
    }

    #[test]
    fn test_connect_records_target() {
        let gateway = Gateway::new(test_config());
        gateway.start().unwrap();

        // Nothing listens on port 1 of the loopback address.
        let mut client = TcpStream::connect(("127.0.0.1", gateway.port())).unwrap();
        client.write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, RESPONSE_502);

        let target = gateway.last_target().unwrap();
        assert_eq!(target.url, "https://127.0.0.1:1");
        assert_eq!(target.gateway_port, gateway.port());
        gateway.stop();
    }

    #[test]
    fn test_reset_during_tunnel_counts_new_traffic() {
        let echo = TcpListener::bind("127.0.0.1:0").unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        let echo_thread = thread::spawn(move || {
            let (mut stream, _) = echo.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buffer = [0u8; 1000];
            let mut echoed = 0;
            loop {
                match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => return echoed,
                    Ok(n) => {
                        stream.write_all(&buffer[..n]).unwrap();
                        echoed += n;
                    }
                }
            }
        });

        let gateway = Gateway::new(test_config());
        gateway.start().unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", gateway.port())).unwrap();
        write!(client, "CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n", echo_port)
            .unwrap();
        let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
        client.read_exact(&mut established).unwrap();
        assert_eq!(established, RESPONSE_200_CONNECT);
        while gateway.stats().bytes_sent() < RESPONSE_200_CONNECT.len() as u64 {
            thread::sleep(Duration::from_millis(5));
        }

        gateway.reset_stats();
        let chunk = [b'x'; 1000];
        let mut reply = [0u8; 1000];
        for _ in 0..10 {
            client.write_all(&chunk).unwrap();
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply, chunk);
        }
        drop(client);
        // The relay closes the upstream side once the client leaves.
        assert_eq!(echo_thread.join().unwrap(), 10_000);
        gateway.stop();

        let stats = gateway.stats();
        assert_eq!(stats.bytes_received(), 20_000);
        assert_eq!(stats.bytes_sent(), 20_000);
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.https_requests(), 0);
    }

    #[test]
    fn test_finish_relay_closes_both_sides() {
        let client_peer = MemoryTransport::new();
        let server_peer = MemoryTransport::new();
        let mut client = client_peer.clone();
        let mut server = server_peer.clone();
        let url = "https://example.com:443";
        finish_relay(url, Some(TunnelEnd::ClientClosed), &mut client, &mut server);
        assert!(client_peer.is_closed());
        assert!(server_peer.is_closed());

        let client_peer = MemoryTransport::new();
        let server_peer = MemoryTransport::new();
        finish_relay(url, None, &mut client_peer.clone(), &mut server_peer.clone());
        assert!(client_peer.is_closed());
        assert!(server_peer.is_closed());
    }

    #[test]
    fn test_write_all_counted() {
        let stats = Stats::new();
        let mut sink = Vec::new();
        write_all_counted(&mut sink, b"abc", &stats).unwrap();
        write_all_counted(&mut sink, b"", &stats).unwrap();
        assert_eq!(sink, b"abc");
        assert_eq!(stats.bytes_sent(), 3);
    }
}
