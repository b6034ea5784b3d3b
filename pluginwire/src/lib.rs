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

//! Wire-level types shared by the host (`pluginreg`) and plugin (`pluginsrv`) sides
//! of the out-of-process plugin protocol.
//!
//! Plugins speak HTTP/1.1 over a Unix-domain socket. This crate defines the
//! on-disk descriptor/runtime-config formats, the reserved method names, and
//! the error type that both sides of the wire use to report transport and
//! protocol failures. It intentionally has no async runtime dependency beyond
//! `hyper`'s `StatusCode`, so it can be depended on by both the host and
//! plugin crates without pulling tokio's full feature set into either.

mod descriptor;
mod error;
mod reserved;
mod runtime_config;

pub use descriptor::PluginDescriptor;
pub use error::WireError;
pub use reserved::{is_reserved, RESERVED_METHODS};
pub use runtime_config::RuntimeConfig;

/// Default extension for discovery-directory descriptor files.
pub const DEFAULT_DESCRIPTOR_EXT: &str = "pconf";

/// Fixed file name for the artifact-mode runtime config, written by the host
/// into a plugin's working directory before spawn.
pub const RUNTIME_CONFIG_FILE: &str = "runtime.conf";

/// Fixed binary name the registry expects inside an untarred plugin artifact.
pub const PLUGIN_BINARY_NAME: &str = "pluginmain";

/// Fixed socket file name used by artifact-mode plugins.
pub const PLUGIN_SOCK_FILE: &str = "pluginconn.sock";

/// Fixed logical URL used by artifact-mode plugins.
pub const PLUGIN_URL: &str = "unix://plugin";
