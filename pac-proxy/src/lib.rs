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

//! # PAC Proxy
//!
//! This crate provides a forwarding HTTP proxy gateway that decides,
//! per request, whether to reach the target directly or through
//! another HTTP proxy, following a Proxy Auto-Configuration (PAC)
//! result string.
//!
//! The main component of this crate is the `Gateway` struct, which
//! owns the listening socket, an accept thread and a pool of workers.
//! `CONNECT` requests are tunneled opaquely; other methods are relayed
//! once and answered with the target's response.
//!
//! The PAC decision comes from a `PacResolver`, which a real PAC
//! engine or a test stub implements. Without one every request is
//! sent straight to its target.
//!
//! ## Example
//!
//! ```
//! use pac_proxy::{Gateway, GatewayConfig, StaticResolver};
//!
//! fn main() -> pac_proxy::Result<()> {
//!     let gateway = Gateway::new(GatewayConfig::new(8080, 0))
//!         .with_resolver(StaticResolver::new("PROXY 127.0.0.1:9000; DIRECT"));
//!     gateway.start()?;
//!     gateway.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Limitations
//!
//! * Only the first usable PAC directive is honored per request.
//! * SOCKS directives are recognized but served as DIRECT.
//! * Plain HTTP responses are relayed as bytes; there is no re-framing.

#[cfg(not(unix))]
compile_error!("pac-proxy waits on sockets with poll(2) and only builds on unix");

mod connector;
mod error;
mod gateway;
pub mod pac;
mod queue;
pub mod request;
mod stats;
pub mod transport;
pub mod tunnel;
mod util;

pub use connector::*;
pub use error::{Error, Result};
pub use gateway::*;
pub use pac::{parse_pac_rules, resolve, PacResolver, ProxyKind, ProxyRule, StaticResolver};
pub use queue::TaskQueue;
pub use stats::{ByteCounter, SharedStats, Stats};
pub use util::{find_available_port, is_port_available, split_host_port};
