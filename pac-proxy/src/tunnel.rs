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

use crate::stats::ByteCounter;
use crate::transport::{Readiness, Transport};
use log::debug;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const BUFFER_SIZE: usize = 8192;

/// Why a tunnel or a response forward stopped.
#[derive(Debug)]
pub enum TunnelEnd {
    ClientClosed,
    ServerClosed,
    /// A hang-up or error was reported on either side.
    HangUp,
    /// The gateway is shutting down.
    Shutdown,
    /// Nothing arrived for the idle timeout.
    IdleTimeout,
    Error(io::Error),
}

/// Move one buffer from `src` to `dst`. Returns false once this
/// direction is finished.
fn transfer<S: Transport, D: Transport>(
    src: &mut S,
    dst: &mut D,
    buffer: &mut [u8],
    stats: &dyn ByteCounter,
) -> bool {
    let n = match src.read(buffer) {
        Ok(0) => return false,
        Ok(n) => n,
        Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
            return true
        }
        Err(e) => {
            debug!("tunnel read failed: {}", e);
            return false;
        }
    };
    stats.add_received(n);
    if let Err(e) = dst.write_all(&buffer[..n]) {
        debug!("tunnel write failed: {}", e);
        return false;
    }
    stats.add_sent(n);
    true
}

/// Pump bytes both ways between `client` and `server` until either
/// side closes, a hang-up is reported, or `running` is cleared.
///
/// The shutdown flag is checked once per `poll_interval`.
pub fn pump<T: Transport>(
    client: &mut T,
    server: &mut T,
    running: &AtomicBool,
    stats: &dyn ByteCounter,
    poll_interval: Duration,
) -> TunnelEnd {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    while running.load(Ordering::Acquire) {
        let (client_ready, server_ready) = match T::wait_pair(client, server, poll_interval) {
            Ok(ready) => ready,
            Err(e) => return TunnelEnd::Error(e),
        };
        if client_ready == Readiness::Closed || server_ready == Readiness::Closed {
            return TunnelEnd::HangUp;
        }
        if client_ready == Readiness::Readable && !transfer(client, server, &mut buffer, stats) {
            return TunnelEnd::ClientClosed;
        }
        if server_ready == Readiness::Readable && !transfer(server, client, &mut buffer, stats) {
            return TunnelEnd::ServerClosed;
        }
    }
    TunnelEnd::Shutdown
}

/// Copy a plain HTTP response from `server` to `client` until the
/// server closes or stays silent for `idle_timeout`.
pub fn forward_response<T: Transport>(
    server: &mut T,
    client: &mut T,
    running: &AtomicBool,
    stats: &dyn ByteCounter,
    poll_interval: Duration,
    idle_timeout: Duration,
) -> TunnelEnd {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut last_activity = Instant::now();
    while running.load(Ordering::Acquire) {
        match server.wait_readable(poll_interval) {
            Ok(Readiness::Readable) => {
                if !transfer(server, client, &mut buffer, stats) {
                    return TunnelEnd::ServerClosed;
                }
                last_activity = Instant::now();
            }
            Ok(Readiness::Closed) => return TunnelEnd::HangUp,
            Ok(Readiness::Idle) if last_activity.elapsed() >= idle_timeout => {
                return TunnelEnd::IdleTimeout
            }
            Ok(Readiness::Idle) => {}
            Err(e) => return TunnelEnd::Error(e),
        }
    }
    TunnelEnd::Shutdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use crate::transport::MemoryTransport;
    use std::sync::Arc;
    use std::thread;

    const TICK: Duration = Duration::from_millis(20);
    const IDLE: Duration = Duration::from_secs(5);

    #[test]
    fn pump_relays_both_directions() {
        let client_peer = MemoryTransport::new();
        let server_peer = MemoryTransport::new();
        let mut client = client_peer.clone();
        let mut server = server_peer.clone();
        let running = AtomicBool::new(true);
        let stats = Stats::new();

        client_peer.feed(b"\x16\x03\x01client hello");
        server_peer.feed(b"server hello");
        client_peer.finish();

        let end = pump(&mut client, &mut server, &running, &stats, TICK);
        assert!(matches!(end, TunnelEnd::ClientClosed));
        assert_eq!(server_peer.written(), b"\x16\x03\x01client hello");
        assert_eq!(client_peer.written(), b"server hello");
        assert_eq!(stats.bytes_received(), 27);
        assert_eq!(stats.bytes_sent(), 27);
    }

    #[test]
    fn pump_stops_on_hang_up() {
        let client_peer = MemoryTransport::new();
        let server_peer = MemoryTransport::new();
        let mut client = client_peer.clone();
        let mut server = server_peer.clone();
        let running = AtomicBool::new(true);
        let stats = Stats::new();

        server_peer.hang_up();
        let end = pump(&mut client, &mut server, &running, &stats, TICK);
        assert!(matches!(end, TunnelEnd::HangUp));
        assert_eq!(stats.bytes_sent(), 0);
    }

    #[test]
    fn pump_observes_shutdown() {
        let mut client = MemoryTransport::new();
        let mut server = MemoryTransport::new();
        let running = Arc::new(AtomicBool::new(true));
        let stats = Stats::new();

        let flag = running.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(false, Ordering::Release);
        });
        let end = pump(&mut client, &mut server, &running, &stats, TICK);
        assert!(matches!(end, TunnelEnd::Shutdown));
        stopper.join().unwrap();
    }

    #[test]
    fn forward_response_until_server_closes() {
        let server_peer = MemoryTransport::new();
        let client_peer = MemoryTransport::new();
        let mut server = server_peer.clone();
        let mut client = client_peer.clone();
        let running = AtomicBool::new(true);
        let stats = Stats::new();

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        server_peer.feed(response);
        server_peer.finish();
        let end = forward_response(&mut server, &mut client, &running, &stats, TICK, IDLE);
        assert!(matches!(end, TunnelEnd::ServerClosed));
        assert_eq!(client_peer.written(), response);
    }

    #[test]
    fn forward_response_idle_timeout() {
        let mut server = MemoryTransport::new();
        let mut client = MemoryTransport::new();
        let running = AtomicBool::new(true);
        let stats = Stats::new();

        let end = forward_response(&mut server, &mut client, &running, &stats, TICK, TICK * 2);
        assert!(matches!(end, TunnelEnd::IdleTimeout));
    }
}
