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

use hyper::StatusCode;
use thiserror::Error;

/// Errors that can occur while framing or parsing the wire protocol, or while
/// reading/writing the descriptor and runtime-config files.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),
}
