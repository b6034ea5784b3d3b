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
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use hyper::StatusCode;
use tokio::sync::Mutex;

use crate::client::UdsClient;
use crate::config::RegistryConfig;
use crate::discovery::DiscoveryEvent;
use crate::error::RegistryError;
use crate::plugin::LoadedPlugin;

/// State shared between a [`PluginRegistry`] handle and the [`LoadedPlugin`]s
/// it owns. `LoadedPlugin` holds a `Weak` reference back into this so that a
/// transport failure discovered mid-`execute` can trigger `reload_key`
/// without the registry and its plugins owning each other strongly.
pub(crate) struct RegistryShared {
    plugins: Mutex<HashMap<String, Arc<LoadedPlugin>>>,
    known: Mutex<HashMap<String, pluginwire::PluginDescriptor>>,
    config: RegistryConfig,
}

impl RegistryShared {
    pub(crate) async fn reload_key(&self, key: &str) -> Result<(), RegistryError> {
        reload(self, key).await
    }
}

/// Host-side registry of connected plugins: tracks what's been discovered,
/// what's loaded, and owns the spawn/connect/activate/unload/reload state
/// machine for each.
#[derive(Clone)]
pub struct PluginRegistry {
    shared: Arc<RegistryShared>,
}

impl PluginRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        PluginRegistry {
            shared: Arc::new(RegistryShared {
                plugins: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub async fn get(&self, key: &str) -> Option<Arc<LoadedPlugin>> {
        self.shared.plugins.lock().await.get(key).cloned()
    }

    pub async fn loaded_keys(&self) -> Vec<String> {
        self.shared.plugins.lock().await.keys().cloned().collect()
    }

    pub async fn known_keys(&self) -> Vec<String> {
        self.shared.known.lock().await.keys().cloned().collect()
    }

    /// Feeds one discovery change into the registry. A non-lazy descriptor
    /// is connected to immediately; a lazy one is only remembered, and
    /// actually connected on the first `load_discovered` or `execute` that
    /// needs it. A removal unloads the plugin if it was loaded.
    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) -> Result<(), RegistryError> {
        match event {
            DiscoveryEvent::Discovered(desc) => {
                let key = desc.key();
                let lazy = desc.lazy_load;
                self.shared.known.lock().await.insert(key.clone(), desc);
                if !lazy {
                    self.load_discovered(&key).await?;
                }
                Ok(())
            }
            DiscoveryEvent::Removed(key) => {
                self.shared.known.lock().await.remove(&key);
                self.unload(&key).await
            }
        }
    }

    /// Connects to and activates a previously discovered plugin by key.
    /// Returns the existing handle without reconnecting if it's already
    /// loaded — this is what lets a lazy-load descriptor stay merely known
    /// until something actually needs it.
    pub async fn load_discovered(&self, key: &str) -> Result<Arc<LoadedPlugin>, RegistryError> {
        if let Some(existing) = self.get(key).await {
            return Ok(existing);
        }
        let desc = self
            .shared
            .known
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::PluginNotDiscovered(key.to_string()))?;

        let mut conn = connect_with_retry(&desc.sock, &self.shared.config).await?;
        // A non-200 or malformed Activate leaves the plugin registered with
        // an empty method list rather than dropping it: the caller still
        // gets a handle back (via a later `get`) to decide whether to
        // unload it.
        let activate_result = activate(&mut conn).await;
        let methods = match &activate_result {
            Ok(methods) => methods.clone(),
            Err(_) => Vec::new(),
        };
        let plugin = Arc::new(LoadedPlugin::new(
            desc.name.clone(),
            desc.namespace.clone(),
            desc.url.clone(),
            desc.sock.clone(),
            None,
            conn,
            methods,
            0,
            Arc::downgrade(&self.shared),
            self.shared.config.execute_timeout,
        ));
        self.shared.plugins.lock().await.insert(key.to_string(), plugin.clone());
        activate_result?;
        Ok(plugin)
    }

    /// Spawns a plugin process from an artifact directory expected to
    /// contain a `pluginmain` binary, waits out the startup grace period,
    /// then connects and activates it. The registry owns this process's
    /// lifetime and can `reload_key` it on crash or transport failure.
    pub async fn spawn_and_load(
        &self,
        key: impl Into<String>,
        artifact_dir: impl Into<PathBuf>,
    ) -> Result<Arc<LoadedPlugin>, RegistryError> {
        let key = key.into();
        if self.get(&key).await.is_some() {
            return Err(RegistryError::PluginAlreadyLoaded(key));
        }
        let artifact_dir = artifact_dir.into();
        let (url, sock, pid) = spawn_process(&key, &artifact_dir)?;

        tokio::time::sleep(self.shared.config.startup_grace_period()).await;
        // Connection retries exhausted: the child never came up as a plugin
        // we can talk to, so it's killed here rather than left running
        // unsupervised.
        let mut conn = match connect_with_retry(&sock, &self.shared.config).await {
            Ok(conn) => conn,
            Err(e) => {
                signal_plugin(pid);
                return Err(e);
            }
        };
        // Unlike a connect failure, a non-200 or malformed Activate still
        // leaves the (now connected) plugin registered with an empty method
        // list rather than killing it, matching `load_discovered` above.
        let activate_result = activate(&mut conn).await;
        let methods = match &activate_result {
            Ok(methods) => methods.clone(),
            Err(_) => Vec::new(),
        };

        let plugin = Arc::new(LoadedPlugin::new(
            key.clone(),
            None,
            url,
            sock,
            Some(artifact_dir),
            conn,
            methods,
            pid,
            Arc::downgrade(&self.shared),
            self.shared.config.execute_timeout,
        ));
        self.shared.plugins.lock().await.insert(key, plugin.clone());
        activate_result?;
        Ok(plugin)
    }

    /// Stops a loaded plugin: calls its `Stop` method, signals its process
    /// to exit if this registry spawned it, and drops it from the registry.
    /// Idempotent — unloading a key that isn't loaded is not an error.
    pub async fn unload(&self, key: &str) -> Result<(), RegistryError> {
        let plugin = self.shared.plugins.lock().await.remove(key);
        let Some(plugin) = plugin else { return Ok(()) };
        plugin.terminate_callbacks();
        // Best-effort: the plugin may already be gone (that's often why
        // we're unloading it), so a failed Stop call isn't propagated.
        if let Err(e) = plugin.stop().await {
            tracing::debug!(%key, error = %e, "Stop call during unload failed, proceeding anyway");
        }
        if plugin.pid() != 0 {
            signal_plugin(plugin.pid());
        }
        Ok(())
    }

    /// Reloads a plugin in place: signals its old process (if this registry
    /// spawned it) with `SIGUSR1`, respawns it from the same artifact
    /// directory, reconnects, and re-activates — mutating the existing
    /// `Arc<LoadedPlugin>` rather than replacing it, so handles a caller
    /// already holds stay valid. Only artifact-mode plugins can be reloaded:
    /// a purely self-managed discovered plugin has no process for the host
    /// to restart on its behalf.
    pub async fn reload_key(&self, key: &str) -> Result<(), RegistryError> {
        self.shared.reload_key(key).await
    }
}

async fn reload(shared: &RegistryShared, key: &str) -> Result<(), RegistryError> {
    let plugin = shared
        .plugins
        .lock()
        .await
        .get(key)
        .cloned()
        .ok_or_else(|| RegistryError::PluginNotDiscovered(key.to_string()))?;
    let Some(artifact_dir) = plugin.artifact_dir.clone() else {
        return Err(RegistryError::PluginConnFailed(format!("{key} has no artifact directory to reload from")));
    };
    if plugin.pid() != 0 {
        signal_plugin(plugin.pid());
    }
    let (_, sock, pid) = spawn_process(key, &artifact_dir)?;
    tokio::time::sleep(shared.config.startup_grace_period()).await;
    let mut conn = connect_with_retry(&sock, &shared.config).await?;
    let methods = activate(&mut conn).await?;
    plugin.replace_connection(conn, methods, pid).await;
    Ok(())
}

/// Chmods the plugin binary executable, writes `runtime.conf`, and execs it
/// detached. The registry tracks the child by pid (for `SIGUSR1` on unload
/// or reload) rather than holding its `Child` handle, so the process is
/// intentionally not reaped here.
fn spawn_process(key: &str, artifact_dir: &Path) -> Result<(String, PathBuf, u32), RegistryError> {
    let bin_path = artifact_dir.join(pluginwire::PLUGIN_BINARY_NAME);
    let mut perms = std::fs::metadata(&bin_path)?.permissions();
    perms.set_mode(0o777);
    std::fs::set_permissions(&bin_path, perms)?;

    let sock = artifact_dir.join(pluginwire::PLUGIN_SOCK_FILE);
    let url = pluginwire::PLUGIN_URL.to_string();
    let runtime_conf = pluginwire::RuntimeConfig::new(url.clone(), pluginwire::PLUGIN_SOCK_FILE);
    runtime_conf.write_to(artifact_dir)?;

    let mut child = std::process::Command::new(&bin_path)
        .current_dir(artifact_dir)
        .spawn()
        .map_err(|e| RegistryError::SpawnError(format!("{key}: {e}")))?;
    let pid = child.id();
    // The registry supervises this process by pid (for SIGUSR1 on unload or
    // reload), not by holding its `Child`; a background thread just reaps it
    // so it doesn't become a zombie once it exits.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok((url, sock, pid))
}

async fn connect_with_retry(sock: &Path, config: &RegistryConfig) -> Result<UdsClient, RegistryError> {
    let mut last_err = None;
    for attempt in 0..config.connect_retry_count {
        match UdsClient::connect(sock).await {
            Ok(c) => return Ok(c),
            Err(e) => {
                tracing::debug!(sock = %sock.display(), attempt, error = %e, "connect attempt failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(config.connect_retry_interval).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RegistryError::PluginConnFailed(sock.display().to_string())))
}

async fn activate(conn: &mut UdsClient) -> Result<Vec<String>, RegistryError> {
    let (status, body) = conn.request("Activate", Bytes::new()).await?;
    if status != StatusCode::OK {
        return Err(RegistryError::ActivateError(format!("Activate returned {status}")));
    }
    serde_json::from_slice(&body).map_err(|e| RegistryError::ActivateError(e.to_string()))
}

/// Signals a plugin process with `SIGUSR1`, the same signal the original
/// implementation uses to ask a plugin to exit. This is a best-effort kill:
/// a plugin that ignores `SIGUSR1` is left running, matching source
/// behavior rather than escalating to `SIGKILL`.
fn signal_plugin(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGUSR1) {
        tracing::warn!(pid, error = %e, "failed to signal plugin process");
    }
}
