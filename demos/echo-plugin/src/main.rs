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

//! A minimal discovery-mode plugin: registers one method, `Echo`, that
//! returns its request body unchanged. Intended as a template for plugin
//! authors and as a real process for `pluginreg`'s integration tests to
//! drive.

use std::path::PathBuf;

use bytes::Bytes;
use pluginsrv::{LaunchMode, PluginBuilder, PluginConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let discovery_dir = PathBuf::from(args.next().expect("usage: echo-plugin <discovery-dir> <sock-path>"));
    let sock = PathBuf::from(args.next().expect("usage: echo-plugin <discovery-dir> <sock-path>"));

    let mut builder = PluginBuilder::new(PluginConfig {
        name: "echo".into(),
        namespace: None,
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        mode: LaunchMode::Discovered {
            discovery_dir,
            descriptor_ext: pluginwire::DEFAULT_DESCRIPTOR_EXT.to_string(),
            sock,
            lazy_load: false,
        },
    })
    .expect("plugin config");

    builder.register("Echo", |body: Bytes| body).expect("register Echo");
    builder.on_activate(|_| {
        tracing::info!("activated");
        Bytes::new()
    });
    builder.on_stop(|_| {
        tracing::info!("stopping");
        Bytes::new()
    });

    let mut plugin = builder.start().await.expect("start plugin server");
    tracing::info!("echo-plugin listening");
    plugin.wait_until_stopped().await.expect("serve until stopped");
}
