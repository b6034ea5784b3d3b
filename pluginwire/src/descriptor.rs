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

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// A plugin's self-advertised identity, persisted as a small JSON file in a
/// discovery directory. The plugin process writes this file at `Start` and
/// removes it at clean `Stop`; its presence means "claiming to be runnable",
/// not "alive" — liveness is only established by a successful `Activate`.
///
/// Unknown JSON fields are ignored on read, so the format can grow without
/// breaking older readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "NameSpace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "Sock")]
    pub sock: PathBuf,
    #[serde(rename = "LazyLoad")]
    pub lazy_load: bool,
}

impl PluginDescriptor {
    /// Builds a descriptor, filling in the default `unix://<namespace><name>`
    /// url when the caller doesn't supply one.
    pub fn new(
        name: impl Into<String>,
        namespace: Option<String>,
        sock: impl Into<PathBuf>,
        lazy_load: bool,
    ) -> Result<Self, WireError> {
        let name = name.into();
        if name.is_empty() {
            return Err(WireError::InvalidDescriptor("plugin name must not be empty".into()));
        }
        let url = default_url(namespace.as_deref(), &name);
        Ok(PluginDescriptor { name, namespace, version: None, url, sock: sock.into(), lazy_load })
    }

    /// The registry-unique key for this plugin: `namespace+name`.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Parses a descriptor from its on-disk JSON representation.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let desc: PluginDescriptor =
            serde_json::from_slice(bytes).map_err(|e| WireError::InvalidDescriptor(e.to_string()))?;
        if desc.name.is_empty() {
            return Err(WireError::InvalidDescriptor("plugin name must not be empty".into()));
        }
        Ok(desc)
    }

    /// Reads and parses a descriptor file from disk.
    pub fn read_from(path: &Path) -> Result<Self, WireError> {
        let bytes = fs::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Writes the descriptor to `dir/<name>.<ext>` atomically: the content is
    /// written to a temporary file in the same directory and then renamed
    /// into place, so a concurrent discovery scan never observes a partial
    /// write (the source implementation uses a plain create, which doesn't
    /// have this guarantee).
    pub fn write_atomic(&self, dir: &Path, ext: &str) -> Result<PathBuf, WireError> {
        fs::create_dir_all(dir)?;
        let final_path = dir.join(format!("{}.{}", self.key(), ext));
        let tmp_path = dir.join(format!(".{}.{}.tmp", self.key(), ext));
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| WireError::InvalidDescriptor(e.to_string()))?;
        {
            let mut f = File::create(&tmp_path)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    /// Removes the descriptor file at `dir/<name>.<ext>`, if present.
    /// Idempotent: a missing file is not an error.
    pub fn remove(dir: &Path, key: &str, ext: &str) -> Result<(), WireError> {
        let path = dir.join(format!("{key}.{ext}"));
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Computes the default logical url for a plugin: `unix://<namespace><name>`.
pub fn default_url(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("unix://{ns}{name}"),
        _ => format!("unix://{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_includes_namespace_when_present() {
        assert_eq!(default_url(Some("ns."), "foo"), "unix://ns.foo");
        assert_eq!(default_url(None, "foo"), "unix://foo");
    }

    #[test]
    fn key_combines_namespace_and_name() {
        let d = PluginDescriptor::new("foo", Some("ns.".into()), "/tmp/foo.sock", false).unwrap();
        assert_eq!(d.key(), "ns.foo");
    }

    #[test]
    fn rejects_empty_name() {
        assert!(PluginDescriptor::new("", None, "/tmp/x.sock", false).is_err());
    }

    #[test]
    fn round_trips_through_json_with_unknown_fields_tolerated() {
        let raw = r#"{
            "Name": "echo",
            "Url": "unix://echo",
            "Sock": "/tmp/echo.sock",
            "LazyLoad": true,
            "SomeFutureField": 42
        }"#;
        let desc = PluginDescriptor::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(desc.name, "echo");
        assert!(desc.namespace.is_none());
        assert!(desc.lazy_load);
    }

    #[test]
    fn write_atomic_then_read_from_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let desc = PluginDescriptor::new("echo", None, "/tmp/echo.sock", false).unwrap();
        let path = desc.write_atomic(dir.path(), "pconf").unwrap();
        let read_back = PluginDescriptor::read_from(&path).unwrap();
        assert_eq!(desc, read_back);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        PluginDescriptor::remove(dir.path(), "nonexistent", "pconf").unwrap();
        PluginDescriptor::remove(dir.path(), "nonexistent", "pconf").unwrap();
    }
}
