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

// # Gateway Utils
//
// Helpers shared by the request parser, the PAC resolver and the
// gateway: splitting `host[:port]` strings, probing for a free local
// port, and exposing a `TcpStream` as a raw descriptor for `poll`.

use crate::Error;
use rand::seq::SliceRandom;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

pub type RawDescriptor = i32;

/// Split `host[:port]` on the last colon, applying `default_port` when
/// no port is given.
///
/// IPv6 literals must be bracketed to carry a port (`[::1]:8080`); the
/// brackets are removed from the returned host. An unbracketed literal
/// such as `::1` is taken as a host without a port.
pub fn split_host_port(input: &str, default_port: u16) -> Result<(String, u16), Error> {
    let input = input.trim();
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or(Error::InvalidHost)?;
        if host.is_empty() {
            return Err(Error::InvalidHost);
        }
        let port = match after {
            "" => default_port,
            _ => parse_port(after.strip_prefix(':').ok_or(Error::InvalidHost)?)?,
        };
        return Ok((host.to_string(), port));
    }
    let (host, port) = match input.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => (input, default_port),
        Some((host, port)) => (host, parse_port(port)?),
        None => (input, default_port),
    };
    if host.is_empty() {
        return Err(Error::InvalidHost);
    }
    Ok((host.to_string(), port))
}

fn parse_port(port: &str) -> Result<u16, Error> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::InvalidPortNumber),
        Ok(port) => Ok(port),
    }
}

/// Whether `port` can currently be bound on the loopback interface.
pub fn is_port_available(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    if socket.set_reuse_address(true).is_err() {
        return false;
    }
    socket.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, port)).into()).is_ok()
}

/// Probe the inclusive range `start..=end` in random order and return
/// the first port that can be bound.
pub fn find_available_port(start: u16, end: u16) -> Option<u16> {
    let mut ports: Vec<u16> = (start..=end).collect();
    ports.shuffle(&mut rand::thread_rng());
    ports.into_iter().find(|&port| is_port_available(port))
}

pub fn raw_descriptor(stream: &TcpStream) -> RawDescriptor {
    stream.as_raw_fd()
}
