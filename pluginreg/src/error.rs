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

use thiserror::Error;

/// Errors surfaced by the host-side plugin registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] pluginwire::WireError),

    #[error("failed to parse descriptor: {0}")]
    DescriptorParseError(String),

    #[error("plugin '{0}' was not discovered")]
    PluginNotDiscovered(String),

    #[error("plugin '{0}' is already loaded")]
    PluginAlreadyLoaded(String),

    #[error("failed to spawn plugin process: {0}")]
    SpawnError(String),

    #[error("failed to connect to plugin socket after retrying: {0}")]
    PluginConnFailed(String),

    #[error("Activate failed or returned a malformed method list: {0}")]
    ActivateError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("method '{0}' is not registered on this plugin")]
    MethodNotRegistered(String),

    #[error("callback '{0}' is already registered")]
    CallbackAlreadyRegistered(String),

    #[error("plugin '{0}' is disconnected and could not be recovered")]
    PluginDisconnected(String),

    #[error("request to plugin '{0}' timed out")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),
}
