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

mod args;

use anyhow::Context;
use args::PacProxyArgs;
use clap::Parser;
use log::info;
use pac_proxy::{Gateway, GatewayConfig, StaticResolver};
use std::io;

fn main() -> anyhow::Result<()> {
    pac_proxy_common::logger::init("pac-proxy");
    let args = PacProxyArgs::parse();

    let mut config = GatewayConfig::new(args.port, args.threads);
    if let (Some(user), Some(password)) = (&args.proxy_user, &args.proxy_password) {
        config = config.with_credentials(user, password);
    }
    let gateway = Gateway::new(config);
    if let Some(pac) = args.pac {
        info!("Serving every request with PAC result {:?}", pac);
        gateway.set_resolver(StaticResolver::new(pac));
    }
    gateway.start().with_context(|| format!("Cannot start gateway on port {}", args.port))?;

    // Serve until stdin is closed.
    let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());

    gateway.stop();
    Ok(())
}
