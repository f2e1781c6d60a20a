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

//! This module defines the gateway error types.

use std::fmt;
use std::io;

/// An enumeration of possible errors.
#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// `start` was called on a gateway that is already serving.
    AlreadyRunning,
    /// Socket setup for the listening port failed.
    Bind { port: u16, source: io::Error },
    /// The client request header could not be parsed.
    MalformedRequest(String),
    /// The PAC result string held no usable directive.
    MalformedPacResult,
    InvalidPortNumber,
    InvalidHost,
    /// DNS, socket creation or connect to `host:port` failed.
    Unreachable { host: String, port: u16 },
    /// The upstream proxy answered CONNECT with something other than 200.
    UpstreamRejected { status: String },
    HeaderTooLarge,
}

impl Error {
    /// Whether the failure is the client's fault (answered with 400)
    /// rather than the path to the target (answered with 502).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedRequest(_) | Error::InvalidPortNumber | Error::InvalidHost
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::AlreadyRunning => write!(f, "Gateway is already running"),
            Error::Bind { port, source } => {
                write!(f, "Failed to listen on port {}: {}", port, source)
            }
            Error::MalformedRequest(reason) => write!(f, "Malformed request: {}", reason),
            Error::MalformedPacResult => write!(f, "No usable directive in PAC result"),
            Error::InvalidPortNumber => write!(f, "Invalid port number"),
            Error::InvalidHost => write!(f, "Invalid host"),
            Error::Unreachable { host, port } => write!(f, "Cannot reach {}:{}", host, port),
            Error::UpstreamRejected { status } => {
                write!(f, "Upstream proxy rejected CONNECT: {}", status)
            }
            Error::HeaderTooLarge => write!(f, "Header exceeds maximum size"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            Error::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
