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

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use hyper::StatusCode;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::UdsClient;
use crate::error::RegistryError;
use crate::registry::RegistryShared;

/// A host-side handle to one connected plugin: its methods, its connection,
/// and any callback workers registered against it.
///
/// `connection` and `pid` are mutated in place by `reload` so that a
/// `Arc<LoadedPlugin>` a caller is already holding stays valid across a
/// crash-and-respawn cycle; the registry never needs to replace the `Arc`
/// itself, only its interior.
pub struct LoadedPlugin {
    pub name: String,
    pub namespace: Option<String>,
    pub url: String,
    sock_path: PathBuf,
    /// Set only for plugins this registry spawned itself (artifact mode);
    /// `None` for self-managed plugins found purely through discovery.
    pub artifact_dir: Option<PathBuf>,
    connection: Mutex<Option<UdsClient>>,
    methods: RwLock<Vec<String>>,
    callbacks: DashMap<String, CallbackHandle>,
    connected: AtomicBool,
    pub(crate) pid: AtomicU32,
    registry: Weak<RegistryShared>,
    /// Upper bound on a single `execute` call, copied from `RegistryConfig`
    /// at load time. `None` disables the timeout.
    execute_timeout: Option<Duration>,
}

struct CallbackHandle {
    callback: Arc<dyn Fn(Bytes) + Send + Sync>,
    join: JoinHandle<()>,
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

impl LoadedPlugin {
    pub(crate) fn new(
        name: String,
        namespace: Option<String>,
        url: String,
        sock_path: PathBuf,
        artifact_dir: Option<PathBuf>,
        connection: UdsClient,
        methods: Vec<String>,
        pid: u32,
        registry: Weak<RegistryShared>,
        execute_timeout: Option<Duration>,
    ) -> Self {
        LoadedPlugin {
            name,
            namespace,
            url,
            sock_path,
            artifact_dir,
            connection: Mutex::new(Some(connection)),
            methods: RwLock::new(methods),
            callbacks: DashMap::new(),
            connected: AtomicBool::new(true),
            pid: AtomicU32::new(pid),
            registry,
            execute_timeout,
        }
    }

    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn methods(&self) -> Vec<String> {
        self.methods.read().await.clone()
    }

    pub(crate) fn sock_path(&self) -> &std::path::Path {
        &self.sock_path
    }

    /// Round-trips `b"Test Data"` through the plugin's `Ping` method and
    /// checks the echo, the same liveness probe the registry uses right
    /// after `Activate` during load.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        let probe = Bytes::from_static(b"Test Data");
        let (status, body) = self.send("Ping", probe.clone()).await?;
        if status != StatusCode::OK {
            return Err(RegistryError::TransportError(format!("Ping returned {status}")));
        }
        if body != probe {
            return Err(RegistryError::TransportError("Ping echo mismatch".into()));
        }
        Ok(())
    }

    /// Invokes a user method, recovering from a transport failure by
    /// reconnecting and, if that's not enough, asking the owning registry to
    /// reload this plugin in place. Returns `PluginDisconnected` only once
    /// reconnect and reload have both been tried and failed.
    ///
    /// The whole call, including any reconnect/reload recovery it triggers,
    /// is bounded by `RegistryConfig::execute_timeout` so a wedged plugin
    /// can't block the caller indefinitely. See the design notes for why
    /// this timeout exists.
    pub async fn execute(&self, method: &str, body: Bytes) -> Result<Bytes, RegistryError> {
        match self.execute_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.execute_inner(method, body))
                .await
                .unwrap_or_else(|_| Err(RegistryError::Timeout(method.to_string()))),
            None => self.execute_inner(method, body).await,
        }
    }

    async fn execute_inner(&self, method: &str, body: Bytes) -> Result<Bytes, RegistryError> {
        if !self.methods.read().await.iter().any(|m| m == method) {
            return Err(RegistryError::MethodNotRegistered(method.to_string()));
        }

        if let Ok((status, resp)) = self.send(method, body.clone()).await {
            if status == StatusCode::OK {
                return Ok(resp);
            }
            return Err(RegistryError::TransportError(format!("{method} returned {status}")));
        }

        self.connected.store(false, Ordering::Release);
        tracing::warn!(plugin = %self.key(), %method, "transport failure, attempting reconnect");
        if self.reconnect().await.is_ok() {
            if let Ok((status, resp)) = self.send(method, body.clone()).await {
                if status == StatusCode::OK {
                    return Ok(resp);
                }
            }
        }

        tracing::warn!(plugin = %self.key(), "reconnect insufficient, attempting reload");
        if let Some(registry) = self.registry.upgrade() {
            if registry.reload_key(&self.key()).await.is_ok() {
                if let Ok((status, resp)) = self.send(method, body).await {
                    if status == StatusCode::OK {
                        return Ok(resp);
                    }
                }
            }
        }

        Err(RegistryError::PluginDisconnected(self.key()))
    }

    /// Registers a callback: a host-side function invoked every time the
    /// plugin calls `notify` under `name`. Starts a dedicated long-poll
    /// worker on its own connection, separate from the connection `execute`
    /// and `ping` use, so a plugin that never notifies can't starve other
    /// calls to it (the original implementation reuses a single connection
    /// for both, which is why an `Execute` timeout is recommended alongside
    /// this: see `RegistryConfig::execute_timeout`).
    pub fn register_callback<F>(&self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        if self.callbacks.contains_key(name) {
            return Err(RegistryError::CallbackAlreadyRegistered(name.to_string()));
        }
        let sock_path = self.sock_path.clone();
        let cb_name = name.to_string();
        let callback: Arc<dyn Fn(Bytes) + Send + Sync> = Arc::new(f);
        let join = tokio::spawn(callback_worker(sock_path, cb_name, callback.clone()));
        self.callbacks.insert(name.to_string(), CallbackHandle { callback, join });
        Ok(())
    }

    pub fn unregister_callback(&self, name: &str) {
        self.callbacks.remove(name);
    }

    /// Terminates every registered callback worker without touching the
    /// connection. Used by `unload`, which sends `Stop` itself rather than
    /// going through a worker.
    pub(crate) fn terminate_callbacks(&self) {
        self.callbacks.clear();
    }

    /// Sends the reserved `Stop` method directly, bypassing the user-method
    /// lookup `execute` performs (`Stop` is never in that list).
    pub(crate) async fn stop(&self) -> Result<Bytes, RegistryError> {
        let (status, body) = self.send("Stop", Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(RegistryError::TransportError(format!("Stop returned {status}")));
        }
        Ok(body)
    }

    /// Replaces the live connection and method list after a successful
    /// reload, and restarts every registered callback worker, under its
    /// original name and with its original function, against the refreshed
    /// plugin. A reload invalidates every in-flight long-poll (the plugin
    /// process is gone), but the caller's registration should not have to
    /// survive the crash by hand — the registry's crash recovery is only
    /// useful if callbacks come back with it.
    pub(crate) async fn replace_connection(&self, conn: UdsClient, methods: Vec<String>, pid: u32) {
        *self.connection.lock().await = Some(conn);
        *self.methods.write().await = methods;
        self.pid.store(pid, Ordering::Release);
        self.connected.store(true, Ordering::Release);

        let restarts: Vec<(String, Arc<dyn Fn(Bytes) + Send + Sync>)> =
            self.callbacks.iter().map(|entry| (entry.key().clone(), entry.value().callback.clone())).collect();
        for (name, callback) in restarts {
            let sock_path = self.sock_path.clone();
            let join = tokio::spawn(callback_worker(sock_path, name.clone(), callback.clone()));
            self.callbacks.insert(name, CallbackHandle { callback, join });
        }
    }

    pub(crate) async fn send(&self, method: &str, body: Bytes) -> Result<(StatusCode, Bytes), RegistryError> {
        let mut guard = self.connection.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.request(method, body).await,
            None => Err(RegistryError::TransportError("no connection".into())),
        }
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        let client = UdsClient::connect(&self.sock_path).await?;
        *self.connection.lock().await = Some(client);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
}

/// Long-polls `RegisterCallback` for `name` in a loop, invoking `callback`
/// with each delivered payload. Terminates (rather than retrying forever or
/// panicking) the moment the connection fails or the plugin rejects the
/// poll, matching the rule that a plugin-side fault must never bring down
/// the host process.
async fn callback_worker(sock_path: PathBuf, name: String, callback: Arc<dyn Fn(Bytes) + Send + Sync>) {
    let mut client = match UdsClient::connect(&sock_path).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(callback = %name, error = %e, "callback worker failed to connect, terminating");
            return;
        }
    };
    loop {
        let body = match serde_json::to_vec(&name) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                tracing::error!(callback = %name, error = %e, "failed to encode callback name");
                return;
            }
        };
        match client.request("RegisterCallback", body).await {
            Ok((status, data)) if status == StatusCode::OK => callback(data),
            Ok((status, _)) => {
                tracing::error!(callback = %name, %status, "RegisterCallback rejected, terminating worker");
                return;
            }
            Err(e) => {
                tracing::error!(callback = %name, error = %e, "callback worker transport error, terminating");
                return;
            }
        }
    }
}
