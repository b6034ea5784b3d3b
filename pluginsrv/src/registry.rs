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

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PluginError;

/// A user method handler: takes the request body and returns the response
/// body. Invoked synchronously on the task serving that connection.
pub type Handler = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

/// Maps user-registered method names to handlers.
///
/// Mutable only before `Start`; registration after `Start` fails with
/// `AlreadyStarted`. Reserved names (`Activate`, `Start`, `Stop`, `Ping`,
/// `RegisterCallback`) can never be registered here — they're handled
/// directly by the server (see `pluginsrv::server`).
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Handler>,
    started: bool,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), PluginError>
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        if self.started {
            return Err(PluginError::AlreadyStarted);
        }
        let name = name.into();
        if pluginwire::is_reserved(&name) {
            return Err(PluginError::ReservedMethodName(name));
        }
        if self.handlers.contains_key(&name) {
            return Err(PluginError::DuplicateMethod(name));
        }
        self.handlers.insert(name, Arc::new(f));
        Ok(())
    }

    /// Freezes the registry: subsequent `register` calls fail. Called once,
    /// by `PluginBuilder::start`.
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    /// User method names, in sorted order, for the `Activate` response body.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
