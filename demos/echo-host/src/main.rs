// Copyright 2016 Google Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal host: discovers plugins in a directory (polling backend, for
//! portability) and, once it finds one named `echo`, calls its `Echo`
//! method and prints the round-tripped response. Pair with `echo-plugin`,
//! pointed at the same discovery directory.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use pluginreg::{DiscoveryService, PluginRegistry, PluginSupervisor, RegistryConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let discovery_dir =
        PathBuf::from(std::env::args().nth(1).expect("usage: echo-host <discovery-dir>"));

    let registry = PluginRegistry::new(RegistryConfig::default());
    let discovery = DiscoveryService::new(discovery_dir, pluginwire::DEFAULT_DESCRIPTOR_EXT);
    let mut supervisor = PluginSupervisor::polling(registry.clone(), discovery);

    tokio::spawn(async move { supervisor.run().await });

    tracing::info!("waiting for the echo plugin to be discovered");
    let plugin = loop {
        if let Some(plugin) = registry.get("echo").await {
            break plugin;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let reply = plugin
        .execute("Echo", Bytes::from_static(b"hello from the host"))
        .await
        .expect("Echo call");
    tracing::info!(reply = %String::from_utf8_lossy(&reply), "got reply");

    registry.unload("echo").await.expect("unload echo plugin");
}
