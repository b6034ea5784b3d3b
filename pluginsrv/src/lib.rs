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

//! Plugin-side SDK for the out-of-process plugin protocol.
//!
//! A plugin process builds a [`PluginBuilder`], registers its methods, then
//! calls [`PluginBuilder::start`] to bind a Unix-domain socket, begin serving
//! HTTP, and (in discovery mode) publish a [`pluginwire::PluginDescriptor`].
//! The returned [`RunningPlugin`] lets the plugin asynchronously notify
//! host-registered callbacks and wait for the host to `Stop` it.

mod error;
pub mod registry;
mod server;
pub mod waiters;

pub use error::PluginError;
pub use registry::MethodRegistry;
pub use waiters::CallbackWaiterTable;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use pluginwire::{PluginDescriptor, RuntimeConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use registry::Handler;
use server::{DescriptorLocation, ServerState};

/// How a plugin learns its own advertised url/socket path, and whether it
/// participates in filesystem discovery.
pub enum LaunchMode {
    /// Writes a [`PluginDescriptor`] into `discovery_dir` at `start()` and
    /// removes it when the host calls `Stop`, so a host's discovery service
    /// can find this plugin.
    Discovered { discovery_dir: PathBuf, descriptor_ext: String, sock: PathBuf, lazy_load: bool },
    /// Reads `runtime.conf` (written by the host into `dir` before spawning
    /// this process) to learn its url/sock. Does not write a descriptor;
    /// used for artifact-style plugins the host manages directly.
    Artifact { dir: PathBuf },
}

/// Configuration passed to [`PluginBuilder::new`].
pub struct PluginConfig {
    pub name: String,
    pub namespace: Option<String>,
    pub version: Option<String>,
    pub mode: LaunchMode,
}

/// Builds up a plugin's method registry before it starts serving.
///
/// Registration (`register`, `on_activate`, `on_stop`) is only valid before
/// [`start`](PluginBuilder::start); the registry becomes immutable the
/// moment the server begins accepting connections.
pub struct PluginBuilder {
    name: String,
    namespace: Option<String>,
    #[allow(dead_code)] // carried for parity with the descriptor/version surface; not wire-checked
    version: Option<String>,
    url: String,
    sock: PathBuf,
    mode: LaunchMode,
    methods: MethodRegistry,
    activator: Option<Handler>,
    stopper: Option<Handler>,
}

impl PluginBuilder {
    /// Resolves `config.mode` into a concrete url/sock pair and prepares an
    /// empty method registry. Does not touch the filesystem or network yet.
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        if config.name.is_empty() {
            return Err(PluginError::Wire(pluginwire::WireError::InvalidDescriptor(
                "plugin name must not be empty".into(),
            )));
        }
        let (url, sock) = match &config.mode {
            LaunchMode::Discovered { sock, .. } => {
                let url = pluginwire_default_url(config.namespace.as_deref(), &config.name);
                (url, sock.clone())
            }
            LaunchMode::Artifact { dir } => {
                let conf = RuntimeConfig::read_from(dir)?;
                let sock = dir.join(&conf.sock);
                (conf.url, sock)
            }
        };

        Ok(PluginBuilder {
            name: config.name,
            namespace: config.namespace,
            version: config.version,
            url,
            sock,
            mode: config.mode,
            methods: MethodRegistry::new(),
            activator: None,
            stopper: None,
        })
    }

    /// The logical url this plugin will advertise (`unix://<namespace><name>`
    /// in discovery mode, or whatever the host wrote into `runtime.conf` in
    /// artifact mode).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Registers a user method. Fails if `name` is reserved, already
    /// registered, or registration happens after `start()`.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), PluginError>
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.methods.register(name, f)
    }

    /// Registers a function invoked (for side effects only) whenever the
    /// host calls `Activate`. Its return value is discarded: the `Activate`
    /// response body is always exactly the JSON method list.
    pub fn on_activate<F>(&mut self, f: F)
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.activator = Some(Arc::new(f));
    }

    /// Registers a function invoked when the host calls `Stop`. Its return
    /// value becomes the `Stop` response body.
    pub fn on_stop<F>(&mut self, f: F)
    where
        F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
    {
        self.stopper = Some(Arc::new(f));
    }

    /// Publishes the descriptor (if in discovery mode), binds the
    /// Unix-domain socket, and begins serving in a background task. The
    /// plugin is now discoverable and callable.
    pub async fn start(mut self) -> Result<RunningPlugin, PluginError> {
        self.methods.mark_started();

        let descriptor = match &self.mode {
            LaunchMode::Discovered { discovery_dir, descriptor_ext, sock, lazy_load } => {
                let desc =
                    PluginDescriptor::new(self.name.clone(), self.namespace.clone(), sock.clone(), *lazy_load)?;
                desc.write_atomic(discovery_dir, descriptor_ext)?;
                Some(DescriptorLocation {
                    dir: discovery_dir.clone(),
                    key: desc.key(),
                    ext: descriptor_ext.clone(),
                })
            }
            LaunchMode::Artifact { .. } => None,
        };

        let waiters = Arc::new(CallbackWaiterTable::new());
        let state = Arc::new(ServerState {
            methods: self.methods,
            activator: self.activator,
            stopper: self.stopper,
            waiters: waiters.clone(),
            stop_requested: Notify::new(),
            stopped: AtomicBool::new(false),
            descriptor,
        });

        let sock_path = self.sock.clone();
        let serve_state = state.clone();
        let join = tokio::spawn(async move { server::serve(sock_path, serve_state).await });

        Ok(RunningPlugin { state, waiters, join: Some(join) })
    }
}

/// A plugin that has bound its socket and is serving requests.
pub struct RunningPlugin {
    state: Arc<ServerState>,
    waiters: Arc<CallbackWaiterTable>,
    join: Option<JoinHandle<Result<(), PluginError>>>,
}

impl RunningPlugin {
    /// Delivers `data` to the host-side callback registered under `name`.
    /// Blocks (true rendezvous) until the host has a long-poll parked for
    /// that name, guaranteeing the notification isn't lost.
    pub async fn notify(&self, name: &str, data: Bytes) -> Result<(), PluginError> {
        self.waiters.notify(name, data).await
    }

    /// True once the host has called `Stop`.
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Blocks until the host calls `Stop` (or the listener task otherwise
    /// exits), then returns. Safe to call more than once.
    pub async fn wait_until_stopped(&mut self) -> Result<(), PluginError> {
        if let Some(join) = self.join.take() {
            join.await.map_err(|e| {
                PluginError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })??;
        }
        Ok(())
    }
}

fn pluginwire_default_url(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("unix://{ns}{name}"),
        _ => format!("unix://{name}"),
    }
}
