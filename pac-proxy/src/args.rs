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

use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Forwarding proxy gateway with PAC based upstream selection")]
pub struct PacProxyArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Number of worker threads, 0 for one per CPU
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub threads: i32,

    /// Fixed PAC result used for every request, e.g. "PROXY 127.0.0.1:9000; DIRECT"
    #[arg(long)]
    pub pac: Option<String>,

    /// User name for Basic authentication with upstream proxies
    #[arg(long, alias = "proxy_user", requires = "proxy_password")]
    pub proxy_user: Option<String>,

    /// Password for Basic authentication with upstream proxies
    #[arg(long, alias = "proxy_password", requires = "proxy_user")]
    pub proxy_password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = PacProxyArgs::try_parse_from(["pac-proxy"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.threads, 0);
        assert!(args.pac.is_none());
    }

    #[test]
    fn test_all_flags() {
        let args = PacProxyArgs::try_parse_from([
            "pac-proxy",
            "--port",
            "9000",
            "--threads",
            "-1",
            "--pac",
            "PROXY 127.0.0.1:9001",
            "--proxy-user",
            "user",
            "--proxy-password",
            "secret",
        ])
        .unwrap();
        assert_eq!(args.port, 9000);
        assert_eq!(args.threads, -1);
        assert_eq!(args.pac.as_deref(), Some("PROXY 127.0.0.1:9001"));
        assert_eq!(args.proxy_user.as_deref(), Some("user"));
        assert_eq!(args.proxy_password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_user_requires_password() {
        assert!(PacProxyArgs::try_parse_from(["pac-proxy", "--proxy-user", "user"]).is_err());
    }
}
