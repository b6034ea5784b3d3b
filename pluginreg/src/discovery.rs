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
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;

use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher};
use pluginwire::PluginDescriptor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::error::RegistryError;

/// A change observed in a discovery directory.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A descriptor was written (first seen, or its contents changed).
    Discovered(PluginDescriptor),
    /// A descriptor's file disappeared; `key` is `namespace+name`.
    Removed(String),
}

/// Watches one directory of `PluginDescriptor` files for a registry to
/// consume. Two backends are offered: [`watch`](DiscoveryService::watch),
/// which reacts to filesystem events via `notify`, and
/// [`poll`](DiscoveryService::poll), which rescans on a fixed interval. Both
/// emit the same [`DiscoveryEvent`] stream and deduplicate against their own
/// last-known snapshot, so a registry driven by either sees one `Discovered`
/// per actual change, not per filesystem notification.
pub struct DiscoveryService {
    dir: PathBuf,
    ext: String,
}

impl DiscoveryService {
    pub fn new(dir: impl Into<PathBuf>, ext: impl Into<String>) -> Self {
        DiscoveryService { dir: dir.into(), ext: ext.into() }
    }

    /// One-shot scan of every currently valid descriptor in the directory.
    /// Malformed files are skipped and logged, not treated as a scan
    /// failure: one bad descriptor must not hide every other plugin.
    pub fn scan(&self) -> Result<Vec<PluginDescriptor>, RegistryError> {
        scan_dir(&self.dir, &self.ext)
    }

    /// Starts an event-driven background watcher. The returned receiver
    /// yields a `Discovered` for every descriptor present at startup, then
    /// streams further changes debounced by `config.debounce_interval` (the
    /// watcher backend debounces internally, so a burst of writes during one
    /// atomic rename collapses to a single notification). The join handle
    /// completes once the watch thread's channel is torn down.
    pub fn watch(self, config: &RegistryConfig) -> Result<(mpsc::UnboundedReceiver<DiscoveryEvent>, JoinHandle<()>), RegistryError> {
        let (raw_tx, raw_rx) = channel::<DebouncedEvent>();
        let mut fs_watcher = watcher(raw_tx, config.debounce_interval)
            .map_err(|e| RegistryError::Io(std::io::Error::other(e.to_string())))?;
        fs_watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| RegistryError::Io(std::io::Error::other(e.to_string())))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let dir = self.dir.clone();
        let ext = self.ext.clone();

        // notify's channel is a blocking std::sync::mpsc, so the receive
        // loop runs on a dedicated blocking thread rather than an async task.
        let join = tokio::task::spawn_blocking(move || {
            // Keep the watcher alive for the thread's lifetime; dropping it
            // tears down the OS-level inotify/kqueue/etc. registration.
            let _fs_watcher = fs_watcher;
            let mut known: HashMap<String, PluginDescriptor> = HashMap::new();
            for desc in scan_dir(&dir, &ext).unwrap_or_default() {
                let key = desc.key();
                if tx.send(DiscoveryEvent::Discovered(desc.clone())).is_err() {
                    return;
                }
                known.insert(key, desc);
            }

            loop {
                match raw_rx.recv() {
                    Ok(event) => {
                        if let Some(path) = debounced_event_path(event) {
                            if reconcile_path(&path, &ext, &mut known, &tx).is_err() {
                                return;
                            }
                        }
                    }
                    Err(_) => return,
                }
            }
        });

        Ok((rx, join))
    }

    /// Starts a polling background watcher: rescans the directory every
    /// `config.poll_interval` and diffs against the previous snapshot.
    /// Simpler and more portable than `watch`, at the cost of discovery
    /// latency bounded by the poll interval rather than near-instant.
    pub fn poll(self, config: &RegistryConfig) -> (mpsc::UnboundedReceiver<DiscoveryEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = self.dir;
        let ext = self.ext;
        let interval = config.poll_interval;

        let join = tokio::spawn(async move {
            let mut known: HashMap<String, PluginDescriptor> = HashMap::new();
            loop {
                let current = scan_dir(&dir, &ext).unwrap_or_default();
                let mut seen = std::collections::HashSet::new();
                for desc in current {
                    let key = desc.key();
                    seen.insert(key.clone());
                    if known.get(&key) != Some(&desc) {
                        if tx.send(DiscoveryEvent::Discovered(desc.clone())).is_err() {
                            return;
                        }
                        known.insert(key, desc);
                    }
                }
                let gone: Vec<String> = known.keys().filter(|k| !seen.contains(*k)).cloned().collect();
                for key in gone {
                    known.remove(&key);
                    if tx.send(DiscoveryEvent::Removed(key)).is_err() {
                        return;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        (rx, join)
    }
}

/// Flattens a `DebouncedEvent` down to the single path that should be
/// reconciled, if any. `Rename` reconciles its destination, since that's
/// where `write_atomic`'s temp-file rename lands the real descriptor.
fn debounced_event_path(event: DebouncedEvent) -> Option<PathBuf> {
    match event {
        DebouncedEvent::Create(p)
        | DebouncedEvent::Write(p)
        | DebouncedEvent::Chmod(p)
        | DebouncedEvent::Remove(p)
        | DebouncedEvent::NoticeWrite(p)
        | DebouncedEvent::NoticeRemove(p) => Some(p),
        DebouncedEvent::Rename(_from, to) => Some(to),
        DebouncedEvent::Rescan => None,
        DebouncedEvent::Error(e, p) => {
            tracing::warn!(error = %e, path = ?p, "discovery watcher reported an error");
            None
        }
    }
}

fn scan_dir(dir: &Path, ext: &str) -> Result<Vec<PluginDescriptor>, RegistryError> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        // A file name starting with '.' is a write_atomic temp file mid-rename.
        if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.')) {
            continue;
        }
        match PluginDescriptor::read_from(&path) {
            Ok(desc) => out.push(desc),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed descriptor"),
        }
    }
    Ok(out)
}

fn reconcile_path(
    path: &Path,
    ext: &str,
    known: &mut HashMap<String, PluginDescriptor>,
    tx: &mpsc::UnboundedSender<DiscoveryEvent>,
) -> Result<(), ()> {
    if path.extension().and_then(|e| e.to_str()) != Some(ext) {
        return Ok(());
    }
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(s) if !s.starts_with('.') => s.to_string(),
        _ => return Ok(()),
    };

    match PluginDescriptor::read_from(path) {
        Ok(desc) => {
            let key = desc.key();
            if known.get(&key) != Some(&desc) {
                tx.send(DiscoveryEvent::Discovered(desc.clone())).map_err(|_| ())?;
                known.insert(key, desc);
            }
        }
        Err(_) => {
            // File vanished, is empty mid-write, or is malformed. Only treat
            // an actually-missing file as a removal; a transient parse
            // failure on a file that still exists will settle on the next
            // debounced pass once the atomic rename completes.
            if !path.exists() {
                if let Some(desc) = known.remove(&stem) {
                    tx.send(DiscoveryEvent::Removed(desc.key())).map_err(|_| ())?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn scan_skips_malformed_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let desc = PluginDescriptor::new("echo", None, "/tmp/echo.sock", false).unwrap();
        desc.write_atomic(dir.path(), "pconf").unwrap();
        std::fs::write(dir.path().join("broken.pconf"), b"not json").unwrap();
        std::fs::write(dir.path().join(".echo.pconf.tmp"), b"{}").unwrap();

        let svc = DiscoveryService::new(dir.path(), "pconf");
        let found = svc.scan().unwrap();
        assert_eq!(found, vec![desc]);
    }

    #[tokio::test]
    async fn poll_emits_discovered_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let svc = DiscoveryService::new(dir.path(), "pconf");
        let config = RegistryConfig { poll_interval: Duration::from_millis(20), ..Default::default() };
        let (mut rx, join) = svc.poll(&config);

        let desc = PluginDescriptor::new("echo", None, "/tmp/echo.sock", false).unwrap();
        desc.write_atomic(dir.path(), "pconf").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, DiscoveryEvent::Discovered(d) if d == desc));

        PluginDescriptor::remove(dir.path(), &desc.key(), "pconf").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, DiscoveryEvent::Removed(k) if k == desc.key()));

        join.abort();
    }
}
