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

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::error::RegistryError;
use crate::registry::PluginRegistry;

/// Ties a [`DiscoveryService`] to a [`PluginRegistry`]: drains discovery
/// events into the registry for the life of the process, and unloads every
/// loaded plugin on shutdown.
///
/// This is the piece a host binary actually runs; `PluginRegistry` and
/// `DiscoveryService` are usable on their own for hosts that want to drive
/// the event loop themselves (e.g. folding it into an existing `select!`).
pub struct PluginSupervisor {
    registry: PluginRegistry,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    watcher: JoinHandle<()>,
}

impl PluginSupervisor {
    /// Starts event-driven discovery over `dir` and wires it to a fresh
    /// registry built from `registry`.
    pub fn watching(registry: PluginRegistry, discovery: DiscoveryService) -> Result<Self, RegistryError> {
        let (events, watcher) = discovery.watch(registry.config())?;
        Ok(PluginSupervisor { registry, events, watcher })
    }

    /// Starts polling discovery over `dir` instead of the event-driven
    /// backend, for filesystems where `notify` isn't reliable.
    pub fn polling(registry: PluginRegistry, discovery: DiscoveryService) -> Self {
        let (events, watcher) = discovery.poll(registry.config());
        PluginSupervisor { registry, events, watcher }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Drains discovery events into the registry until the discovery
    /// backend's channel closes (the watcher task exited, typically because
    /// its directory was removed out from under it).
    pub async fn run(&mut self) {
        while let Some(event) = self.events.recv().await {
            let event_key = discovery_event_key(&event);
            if let Err(e) = self.registry.handle_discovery_event(event).await {
                tracing::warn!(key = %event_key, error = %e, "failed to apply discovery event");
            }
        }
        tracing::info!("discovery event stream ended, supervisor run loop exiting");
    }

    /// Stops the discovery watcher and unloads every currently loaded
    /// plugin. Intended for a host's graceful-shutdown path (e.g. on
    /// `SIGINT`/`SIGTERM`).
    pub async fn shutdown(self) {
        self.watcher.abort();
        for key in self.registry.loaded_keys().await {
            if let Err(e) = self.registry.unload(&key).await {
                tracing::warn!(%key, error = %e, "failed to unload plugin during shutdown");
            }
        }
    }
}

fn discovery_event_key(event: &DiscoveryEvent) -> String {
    match event {
        DiscoveryEvent::Discovered(desc) => desc.key(),
        DiscoveryEvent::Removed(key) => key.clone(),
    }
}
