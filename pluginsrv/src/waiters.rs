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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};

use crate::error::PluginError;

/// A single callback's rendezvous slot: at most one `RegisterCallback`
/// request may be parked here at a time.
struct Slot {
    parked: Mutex<Option<oneshot::Sender<Bytes>>>,
    /// Signaled every time a new request parks, so a blocked `notify()` can
    /// recheck `parked` without polling.
    armed: Notify,
}

impl Slot {
    fn new() -> Self {
        Slot { parked: Mutex::new(None), armed: Notify::new() }
    }
}

/// Process-wide (per plugin) table of callback rendezvous channels.
///
/// `RegisterCallback` calls `park`, which blocks until a matching `notify`
/// delivers data, or fails immediately if another request is already parked
/// under the same name. `Notify` calls `notify`, which blocks (true
/// rendezvous, not a buffered queue) until a reader is parked if none is
/// currently waiting, guaranteeing a notification is never lost silently.
pub struct CallbackWaiterTable {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    closed: AtomicBool,
}

impl CallbackWaiterTable {
    pub fn new() -> Self {
        CallbackWaiterTable { slots: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    fn slot_for(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(name.to_string()).or_insert_with(|| Arc::new(Slot::new())).clone()
    }

    /// Parks a long-poll `RegisterCallback` request under `name`. Resolves
    /// with the bytes passed to the matching `notify` call.
    pub async fn park(&self, name: &str) -> Result<Bytes, PluginError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PluginError::Stopped);
        }
        let slot = self.slot_for(name);
        let (tx, rx) = oneshot::channel();
        {
            let mut parked = slot.parked.lock().unwrap();
            if parked.is_some() {
                return Err(PluginError::CallbackAlreadyParked(name.to_string()));
            }
            *parked = Some(tx);
        }
        slot.armed.notify_waiters();
        rx.await.map_err(|_| PluginError::Stopped)
    }

    /// Delivers `data` to the callback named `name`. Fails with
    /// `CallbackNotFound` if no `RegisterCallback` has ever parked under that
    /// name; otherwise blocks until a reader is parked, to guarantee
    /// delivery.
    pub async fn notify(&self, name: &str, data: Bytes) -> Result<(), PluginError> {
        let slot = {
            let slots = self.slots.lock().unwrap();
            slots.get(name).cloned()
        };
        let slot = slot.ok_or_else(|| PluginError::CallbackNotFound(name.to_string()))?;
        loop {
            // Register interest in the next `park()`'s wakeup *before*
            // checking `parked`: `Notify` guarantees a `notified()` future
            // created before a matching `notify_waiters()` call observes
            // that call even though it hasn't been polled yet. Checking
            // `parked` first and only creating this future on a miss would
            // leave a window where a `park()` racing in between (setting
            // `parked` and calling `notify_waiters()`) is never observed,
            // deadlocking this call forever.
            let armed = slot.armed.notified();
            let maybe_tx = slot.parked.lock().unwrap().take();
            match maybe_tx {
                Some(tx) => {
                    // Receiver may have been dropped (e.g. connection reset);
                    // that's the caller's problem to observe via reconnection,
                    // not ours to retry.
                    let _ = tx.send(data);
                    return Ok(());
                }
                None => armed.await,
            }
        }
    }

    /// Unblocks every currently-parked request with `PluginError::Stopped`
    /// and rejects any future `park`/`notify` call. Called once, from
    /// `Stop`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let slots = self.slots.lock().unwrap();
        for slot in slots.values() {
            if let Some(tx) = slot.parked.lock().unwrap().take() {
                drop(tx);
            }
        }
    }
}

impl Default for CallbackWaiterTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_before_park_blocks_until_park_arrives() {
        let table = Arc::new(CallbackWaiterTable::new());
        let notifier = {
            let table = table.clone();
            tokio::spawn(async move { table.notify("cb", Bytes::from_static(b"hello")).await })
        };
        // Give the notifier a chance to start blocking before we park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let data = table.park("cb").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"hello"));
        notifier.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn park_before_notify_also_delivers() {
        let table = Arc::new(CallbackWaiterTable::new());
        let parker = {
            let table = table.clone();
            tokio::spawn(async move { table.park("cb").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.notify("cb", Bytes::from_static(b"world")).await.unwrap();
        let data = parker.await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn notify_unknown_callback_is_an_error() {
        let table = CallbackWaiterTable::new();
        let err = table.notify("missing", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::CallbackNotFound(_)));
    }

    #[tokio::test]
    async fn double_park_rejects_the_second_request() {
        let table = Arc::new(CallbackWaiterTable::new());
        let first = {
            let table = table.clone();
            tokio::spawn(async move { table.park("cb").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = table.park("cb").await;
        assert!(matches!(second, Err(PluginError::CallbackAlreadyParked(_))));

        table.notify("cb", Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn notify_per_name_is_fifo() {
        let table = Arc::new(CallbackWaiterTable::new());
        let mut received = Vec::new();
        for msg in [&b"hello"[..], &b"world"[..]] {
            let parker = {
                let table = table.clone();
                tokio::spawn(async move { table.park("cb").await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            table.notify("cb", Bytes::copy_from_slice(msg)).await.unwrap();
            received.push(parker.await.unwrap().unwrap());
        }
        assert_eq!(received, vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
    }

    #[tokio::test]
    async fn close_unblocks_parked_readers() {
        let table = Arc::new(CallbackWaiterTable::new());
        let parker = {
            let table = table.clone();
            tokio::spawn(async move { table.park("cb").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.close();
        let err = parker.await.unwrap().unwrap_err();
        assert!(matches!(err, PluginError::Stopped));

        let err = table.park("cb").await.unwrap_err();
        assert!(matches!(err, PluginError::Stopped));
    }
}
