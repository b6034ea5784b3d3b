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

//! Host-side registry for the out-of-process plugin protocol.
//!
//! A host builds a [`PluginRegistry`], optionally wires it to a
//! [`DiscoveryService`] via [`PluginSupervisor`] to find self-managed
//! plugins on disk, and/or calls [`PluginRegistry::spawn_and_load`] directly
//! for plugins it manages itself from an unpacked artifact directory. Either
//! way it gets back an [`Arc<LoadedPlugin>`](LoadedPlugin) to call methods
//! on and register callbacks against.

mod client;
mod config;
mod discovery;
mod error;
mod plugin;
mod registry;
mod supervisor;

pub use client::UdsClient;
pub use config::RegistryConfig;
pub use discovery::{DiscoveryEvent, DiscoveryService};
pub use error::RegistryError;
pub use plugin::LoadedPlugin;
pub use registry::PluginRegistry;
pub use supervisor::PluginSupervisor;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pluginsrv::{LaunchMode, PluginBuilder, PluginConfig};
    use std::time::Duration;

    fn temp_sock(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pluginreg-test-{name}-{}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn loads_a_discovered_eager_plugin_and_executes_a_method() {
        let discovery_dir = tempfile::tempdir().unwrap();
        let sock = temp_sock("eager");

        let mut builder = PluginBuilder::new(PluginConfig {
            name: "echo".into(),
            namespace: None,
            version: None,
            mode: LaunchMode::Discovered {
                discovery_dir: discovery_dir.path().to_path_buf(),
                descriptor_ext: "pconf".into(),
                sock: sock.clone(),
                lazy_load: false,
            },
        })
        .unwrap();
        builder.register("Do", |b| b).unwrap();
        let running = builder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let config = RegistryConfig { poll_interval: Duration::from_millis(20), ..Default::default() };
        let registry = PluginRegistry::new(config);
        let svc = DiscoveryService::new(discovery_dir.path(), "pconf");
        for desc in svc.scan().unwrap() {
            registry.handle_discovery_event(DiscoveryEvent::Discovered(desc)).await.unwrap();
        }

        let plugin = registry.get("echo").await.expect("eager descriptor should auto-load");
        assert_eq!(plugin.methods().await, vec!["Do".to_string()]);
        let resp = plugin.execute("Do", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(resp, Bytes::from_static(b"hi"));

        drop(running);
    }

    #[tokio::test]
    async fn lazy_descriptor_is_known_but_not_loaded_until_requested() {
        let discovery_dir = tempfile::tempdir().unwrap();
        let sock = temp_sock("lazy");

        let builder = PluginBuilder::new(PluginConfig {
            name: "lazyplug".into(),
            namespace: None,
            version: None,
            mode: LaunchMode::Discovered {
                discovery_dir: discovery_dir.path().to_path_buf(),
                descriptor_ext: "pconf".into(),
                sock: sock.clone(),
                lazy_load: true,
            },
        })
        .unwrap();
        let running = builder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let registry = PluginRegistry::new(RegistryConfig::default());
        let svc = DiscoveryService::new(discovery_dir.path(), "pconf");
        for desc in svc.scan().unwrap() {
            registry.handle_discovery_event(DiscoveryEvent::Discovered(desc)).await.unwrap();
        }

        assert!(registry.get("lazyplug").await.is_none());
        assert_eq!(registry.known_keys().await, vec!["lazyplug".to_string()]);

        let plugin = registry.load_discovered("lazyplug").await.unwrap();
        assert!(plugin.is_connected());

        drop(running);
    }

    #[tokio::test]
    async fn unload_stops_the_plugin_and_removes_it_from_the_registry() {
        let discovery_dir = tempfile::tempdir().unwrap();
        let sock = temp_sock("unload");

        let builder = PluginBuilder::new(PluginConfig {
            name: "stoppable".into(),
            namespace: None,
            version: None,
            mode: LaunchMode::Discovered {
                discovery_dir: discovery_dir.path().to_path_buf(),
                descriptor_ext: "pconf".into(),
                sock: sock.clone(),
                lazy_load: false,
            },
        })
        .unwrap();
        let mut running = builder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let registry = PluginRegistry::new(RegistryConfig::default());
        let svc = DiscoveryService::new(discovery_dir.path(), "pconf");
        for desc in svc.scan().unwrap() {
            registry.handle_discovery_event(DiscoveryEvent::Discovered(desc)).await.unwrap();
        }
        assert!(registry.get("stoppable").await.is_some());

        registry.unload("stoppable").await.unwrap();
        assert!(registry.get("stoppable").await.is_none());

        running.wait_until_stopped().await.unwrap();
    }

    #[tokio::test]
    async fn double_registering_a_callback_is_rejected() {
        let discovery_dir = tempfile::tempdir().unwrap();
        let sock = temp_sock("cbreject");
        let builder = PluginBuilder::new(PluginConfig {
            name: "notifier".into(),
            namespace: None,
            version: None,
            mode: LaunchMode::Discovered {
                discovery_dir: discovery_dir.path().to_path_buf(),
                descriptor_ext: "pconf".into(),
                sock: sock.clone(),
                lazy_load: false,
            },
        })
        .unwrap();
        let running = builder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let registry = PluginRegistry::new(RegistryConfig::default());
        let svc = DiscoveryService::new(discovery_dir.path(), "pconf");
        for desc in svc.scan().unwrap() {
            registry.handle_discovery_event(DiscoveryEvent::Discovered(desc)).await.unwrap();
        }
        let plugin = registry.get("notifier").await.unwrap();

        plugin.register_callback("cb", |_| {}).unwrap();
        assert!(matches!(
            plugin.register_callback("cb", |_| {}),
            Err(RegistryError::CallbackAlreadyRegistered(_))
        ));

        drop(running);
    }
}
