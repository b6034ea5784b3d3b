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

/// Errors surfaced by the plugin-side SDK.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] pluginwire::WireError),

    #[error("method '{0}' is a reserved name")]
    ReservedMethodName(String),

    #[error("method '{0}' is already registered")]
    DuplicateMethod(String),

    #[error("RegisterMethod called after Start")]
    AlreadyStarted,

    #[error("no callback is registered under '{0}'")]
    CallbackNotFound(String),

    #[error("a RegisterCallback request is already parked for '{0}'")]
    CallbackAlreadyParked(String),

    #[error("the plugin has stopped")]
    Stopped,
}
