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
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use pluginsrv::{LaunchMode, PluginBuilder, PluginConfig};
use tokio::net::UnixStream;

/// Minimal HTTP/1.1 client over a Unix-domain socket, enough to drive the
/// plugin server the same way a host's UDS client would.
async fn request(sock: &PathBuf, path: &str, body: Vec<u8>) -> (u16, Vec<u8>) {
    let stream = UnixStream::connect(sock).await.expect("connect to plugin socket");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method("POST")
        .uri(path)
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    let resp = sender.send_request(req).await.expect("send request");
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, body)
}

fn temp_sock(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pluginsrv-test-{name}-{}.sock", std::process::id()))
}

#[tokio::test]
async fn echo_ping_and_execute_round_trip() {
    let sock = temp_sock("ping");
    let discovery_dir = tempfile::tempdir().unwrap();

    let mut builder = PluginBuilder::new(PluginConfig {
        name: "echo".into(),
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
    builder.register("Do", |body| body).unwrap();
    let plugin = builder.start().await.unwrap();
    // give the listener a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (status, body) = request(&sock, "/Ping", b"Test Data".to_vec()).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"Test Data");

    let (status, body) = request(&sock, "/Do", vec![0x01, 0x02]).await;
    assert_eq!(status, 200);
    assert_eq!(body, vec![0x01, 0x02]);

    drop(plugin);
}

#[tokio::test]
async fn activate_returns_exactly_the_user_method_list() {
    let sock = temp_sock("activate");
    let discovery_dir = tempfile::tempdir().unwrap();

    let mut builder = PluginBuilder::new(PluginConfig {
        name: "multi".into(),
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
    builder.register("Work", |b| b).unwrap();
    // The activator's return value must be discarded from the response body.
    builder.on_activate(|_| Bytes::from_static(b"should not appear"));
    let plugin = builder.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (status, body) = request(&sock, "/Activate", vec![]).await;
    assert_eq!(status, 200);
    let methods: Vec<String> = serde_json::from_slice(&body).unwrap();
    assert_eq!(methods, vec!["Do".to_string(), "Work".to_string()]);

    drop(plugin);
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let sock = temp_sock("unknown");
    let discovery_dir = tempfile::tempdir().unwrap();
    let builder = PluginBuilder::new(PluginConfig {
        name: "empty".into(),
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
    let plugin = builder.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (status, _) = request(&sock, "/Missing", vec![]).await;
    assert_eq!(status, 400);

    drop(plugin);
}

#[tokio::test]
async fn callback_delivery_is_fifo_and_double_registration_is_rejected() {
    let sock = temp_sock("callback");
    let discovery_dir = tempfile::tempdir().unwrap();
    let builder = PluginBuilder::new(PluginConfig {
        name: "notifier".into(),
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
    let plugin = Arc::new(builder.start().await.unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let sock_a = sock.clone();
    let first_poll = tokio::spawn(async move {
        request(&sock_a, "/RegisterCallback", serde_json::to_vec("cb").unwrap()).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // A second long-poll for the same name, while the first is parked, must
    // be rejected rather than silently replacing it.
    let (second_status, _) =
        request(&sock, "/RegisterCallback", serde_json::to_vec("cb").unwrap()).await;
    assert_eq!(second_status, 400);

    plugin.notify("cb", Bytes::from_static(b"hello")).await.unwrap();
    let (status, body) = first_poll.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"hello");

    // Second round: the callback can be re-parked and delivered again.
    let counter = Arc::new(AtomicUsize::new(0));
    let sock_b = sock.clone();
    let counter_clone = counter.clone();
    let second_poll = tokio::spawn(async move {
        let (status, body) =
            request(&sock_b, "/RegisterCallback", serde_json::to_vec("cb").unwrap()).await;
        counter_clone.fetch_add(1, Ordering::SeqCst);
        (status, body)
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    plugin.notify("cb", Bytes::from_static(b"world")).await.unwrap();
    let (status, body) = second_poll.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"world");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_removes_descriptor_and_shuts_down_listener() {
    let sock = temp_sock("stop");
    let discovery_dir = tempfile::tempdir().unwrap();
    let builder = PluginBuilder::new(PluginConfig {
        name: "stoppable".into(),
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
    let mut plugin = builder.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let descriptor_path = discovery_dir.path().join("stoppable.pconf");
    assert!(descriptor_path.exists());

    let (status, _) = request(&sock, "/Stop", vec![]).await;
    assert_eq!(status, 200);

    plugin.wait_until_stopped().await.unwrap();
    assert!(!descriptor_path.exists());
    assert!(plugin.is_stopped());
}
