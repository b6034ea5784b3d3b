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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Runtime configuration the host writes into an artifact-style plugin's
/// working directory before spawn, and which the plugin reads back at
/// startup to learn its own advertised url and socket path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub url: String,
    #[serde(rename = "sockpath")]
    pub sock: PathBuf,
}

impl RuntimeConfig {
    pub fn new(url: impl Into<String>, sock: impl Into<PathBuf>) -> Self {
        RuntimeConfig { url: url.into(), sock: sock.into() }
    }

    /// Writes `self` as `<dir>/runtime.conf`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, WireError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(crate::RUNTIME_CONFIG_FILE);
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| WireError::InvalidDescriptor(e.to_string()))?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Reads `<dir>/runtime.conf`.
    pub fn read_from(dir: &Path) -> Result<Self, WireError> {
        let path = dir.join(crate::RUNTIME_CONFIG_FILE);
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| WireError::InvalidDescriptor(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let conf = RuntimeConfig::new("unix://plugin", "pluginconn.sock");
        conf.write_to(dir.path()).unwrap();
        let back = RuntimeConfig::read_from(dir.path()).unwrap();
        assert_eq!(conf, back);
    }

    #[test]
    fn json_field_name_is_sockpath() {
        let conf = RuntimeConfig::new("unix://plugin", "pluginconn.sock");
        let json = serde_json::to_string(&conf).unwrap();
        assert!(json.contains("\"sockpath\""));
    }
}
