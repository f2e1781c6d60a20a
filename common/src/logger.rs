//
//  Copyright 2024 Google, Inc.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at:
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! A logger for the pac-proxy gateway and its tests.
//!
//! Uses the env_logger crate that allows control of logging through
//! the RUST_LOG environment variable.

use chrono::Utc;
use env_logger::{Builder, Env};
use log::{Level, Record};
use std::{io::Write, path::Path};

/// Install the gateway logger, tagging every line with `prefix`.
///
/// Lines look like `pac-proxy I 10-18 09:12:44.031 gateway.rs:120 - message`.
pub fn init(prefix: &'static str) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "{} {} {} {}:{} - {}",
            prefix,
            level_letter(record.level()),
            log_timestamp(),
            file_name(record),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder.init();
}

/// Install a logger suitable for unit and integration tests.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_for_test() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.is_test(true).format(move |buf, record| {
        writeln!(
            buf,
            "{} {} \t| pac-proxy-test: {}",
            level_letter(record.level()),
            log_timestamp(),
            record.args()
        )
    });
    let _ = builder.try_init();
}

fn log_timestamp() -> String {
    Utc::now().format("%m-%d %H:%M:%S%.3f").to_string()
}

fn file_name<'a>(record: &'a Record<'a>) -> &'a str {
    record
        .file()
        .and_then(|path| Path::new(path).file_name())
        .and_then(|name| name.to_str())
        .unwrap_or("N/A")
}

fn level_letter(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_letters() {
        assert_eq!(level_letter(Level::Error), "E");
        assert_eq!(level_letter(Level::Warn), "W");
        assert_eq!(level_letter(Level::Trace), "T");
    }

    #[test]
    fn timestamp_has_millis() {
        let stamp = log_timestamp();
        // MM-DD HH:MM:SS.mmm
        assert_eq!(stamp.len(), 18);
        assert_eq!(&stamp[2..3], "-");
        assert_eq!(&stamp[14..15], ".");
    }

    #[test]
    fn repeated_test_init() {
        init_for_test();
        init_for_test();
        log::info!("Hello pac-proxy");
    }
}
