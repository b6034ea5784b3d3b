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

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::sync::Notify;

use crate::registry::{Handler, MethodRegistry};
use crate::waiters::CallbackWaiterTable;
use crate::PluginError;

/// Where this plugin's descriptor file lives, so `Stop` can remove it.
pub(crate) struct DescriptorLocation {
    pub(crate) dir: PathBuf,
    pub(crate) key: String,
    pub(crate) ext: String,
}

/// Shared state visible to every connection's request dispatcher.
pub(crate) struct ServerState {
    pub(crate) methods: MethodRegistry,
    pub(crate) activator: Option<Handler>,
    pub(crate) stopper: Option<Handler>,
    pub(crate) waiters: Arc<CallbackWaiterTable>,
    pub(crate) stop_requested: Notify,
    pub(crate) stopped: AtomicBool,
    pub(crate) descriptor: Option<DescriptorLocation>,
}

/// Runs the accept loop for one plugin's Unix-domain socket. Each accepted
/// connection is served on its own task, so a connection parked in a
/// long-poll `RegisterCallback` never blocks another connection's `Execute`
/// or `Ping`. Returns once `Stop` has been invoked and the listener has been
/// torn down.
pub(crate) async fn serve(sock_path: PathBuf, state: Arc<ServerState>) -> Result<(), PluginError> {
    // A stale socket file from an uncleanly-stopped previous run would make
    // bind fail; since descriptor presence never implies liveness (only a
    // successful Activate does), it's safe to clear it before binding.
    let _ = std::fs::remove_file(&sock_path);
    let listener = UnixListener::bind(&sock_path)?;
    tracing::info!(sock = %sock_path.display(), "plugin server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(dispatch(state, req).await) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(error = %e, "connection ended");
                    }
                });
            }
            _ = state.stop_requested.notified() => {
                tracing::info!("stop requested, shutting down listener");
                break;
            }
        }
    }
    drop(listener);
    let _ = std::fs::remove_file(&sock_path);
    Ok(())
}

async fn dispatch(state: Arc<ServerState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let method_name = path.trim_start_matches('/');
    if method_name.is_empty() {
        return bad_request();
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return bad_request();
        }
    };

    match method_name {
        "Activate" | "Start" => handle_activate(&state, body),
        "Stop" => handle_stop(&state, body),
        "Ping" => ok_response(body),
        "RegisterCallback" => handle_register_callback(&state, body).await,
        name => handle_user_method(&state, name, body),
    }
}

/// Canonical `Activate` contract: the response body is exactly the
/// JSON-encoded list of user method names. A user-supplied activator is
/// still invoked (for its side effects), but its return value is discarded
/// — some revisions of the source concatenate it onto the method list,
/// which this implementation does not replicate (see design notes on the
/// status-header-before-body / concatenation ambiguity).
fn handle_activate(state: &Arc<ServerState>, body: Bytes) -> Response<Full<Bytes>> {
    if let Some(activator) = &state.activator {
        let _ = activator(body);
    }
    match serde_json::to_vec(&state.methods.method_names()) {
        Ok(json) => ok_response(Bytes::from(json)),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode method list");
            bad_request()
        }
    }
}

fn handle_stop(state: &Arc<ServerState>, body: Bytes) -> Response<Full<Bytes>> {
    let response_body = state.stopper.as_ref().map(|f| f(body)).unwrap_or_default();
    if let Some(loc) = &state.descriptor {
        if let Err(e) = pluginwire::PluginDescriptor::remove(&loc.dir, &loc.key, &loc.ext) {
            tracing::warn!(error = %e, "failed to remove descriptor on stop");
        }
    }
    state.stopped.store(true, Ordering::Release);
    state.waiters.close();
    state.stop_requested.notify_one();
    ok_response(response_body)
}

async fn handle_register_callback(state: &Arc<ServerState>, body: Bytes) -> Response<Full<Bytes>> {
    let name: String = match serde_json::from_slice(&body) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "RegisterCallback body was not a JSON string");
            return bad_request();
        }
    };
    match state.waiters.park(&name).await {
        Ok(data) => ok_response(data),
        Err(e) => {
            tracing::debug!(callback = %name, error = %e, "RegisterCallback rejected");
            bad_request()
        }
    }
}

fn handle_user_method(state: &Arc<ServerState>, name: &str, body: Bytes) -> Response<Full<Bytes>> {
    match state.methods.get(name) {
        Some(handler) => {
            let result = handler(body);
            ok_response(result)
        }
        None => {
            tracing::debug!(method = %name, "unknown method");
            bad_request()
        }
    }
}

/// Status header is written before any body bytes are produced — `hyper`'s
/// `Response` builder enforces this ordering at the type level, which rules
/// out the header-after-body bug seen in some revisions of the source by
/// construction rather than by convention.
fn ok_response(body: Bytes) -> Response<Full<Bytes>> {
    Response::builder().status(StatusCode::OK).body(Full::new(body)).expect("static response is valid")
}

fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::new()))
        .expect("static response is valid")
}
