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

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use crate::error::RegistryError;

/// One persistent, half-duplex HTTP/1.1 client connection to a plugin's
/// Unix-domain socket.
///
/// The plugin's advertised `url` is purely an identity string: since this
/// client dials the socket directly rather than going through a reverse
/// proxy, the wire request path is always `/<method>`, matching what
/// `pluginsrv`'s dispatcher reads off `req.uri().path()`.
pub struct UdsClient {
    sock_path: PathBuf,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
}

impl UdsClient {
    /// Dials `sock_path` and performs the HTTP/1.1 handshake. The connection
    /// driver future is spawned onto its own task; if it exits (peer closed,
    /// reset, protocol error) the next `request` call observes it through
    /// `SendRequest::ready`.
    pub async fn connect(sock_path: &Path) -> Result<Self, RegistryError> {
        let stream = UnixStream::connect(sock_path)
            .await
            .map_err(|e| RegistryError::PluginConnFailed(e.to_string()))?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RegistryError::PluginConnFailed(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "plugin connection driver exited");
            }
        });
        Ok(UdsClient { sock_path: sock_path.to_path_buf(), sender, driver })
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    /// Issues a `POST /<method>` with `body` and waits for the full response.
    /// No per-request timeout is applied here; callers that need one (e.g.
    /// `Execute`, which must not block on a wedged plugin forever) wrap this
    /// in `tokio::time::timeout`.
    pub async fn request(&mut self, method: &str, body: Bytes) -> Result<(StatusCode, Bytes), RegistryError> {
        if self.sender.ready().await.is_err() {
            return Err(RegistryError::TransportError("connection is closed".into()));
        }
        let req = Request::builder()
            .method("POST")
            .uri(format!("/{method}"))
            .body(Full::new(body))
            .map_err(|e| RegistryError::TransportError(e.to_string()))?;
        let resp = self
            .sender
            .send_request(req)
            .await
            .map_err(|e| RegistryError::TransportError(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RegistryError::TransportError(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

impl Drop for UdsClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
