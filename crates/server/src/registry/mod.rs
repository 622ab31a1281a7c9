// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::Result;
use uuid::Uuid;

use shared::{errors::CoreError, log, protocol::TunnelStream, system::trigger::Trigger};

/// What the registry needs from a registered control connection. The
/// concrete type lives in the service; tests plug in fakes.
#[async_trait::async_trait]
pub trait ControlChannel: Send + Sync {
    fn id(&self) -> Uuid;
    fn key_id(&self) -> &str;
    /// Lifecycle latch, set once the connection is gone.
    fn done(&self) -> Trigger;
    async fn send_connect(&self, request_id: Uuid) -> Result<()>;
    async fn send_ping(&self) -> Result<()>;
    async fn send_event(&self, name: &str, payload: serde_json::Value) -> Result<()>;
    fn close(&self);
}

struct KeyPool {
    conns: Vec<Arc<dyn ControlChannel>>,
    cursor: usize,
}

struct PendingEntry {
    slot: flume::Sender<Box<dyn TunnelStream>>,
    parent: Trigger,
}

/// Handle returned by `request`. Exactly one of resolve, cancel or
/// parent-close consumes it.
#[derive(Debug)]
pub struct ConnRequest {
    pub id: Uuid,
    slot: flume::Receiver<Box<dyn TunnelStream>>,
    parent: Trigger,
}

impl ConnRequest {
    /// The chosen control connection's lifecycle latch. Requests rooted at a
    /// dead control connection are worthless, so splices watch this too.
    pub fn parent(&self) -> Trigger {
        self.parent.clone()
    }

    /// Wait for the agent to open the matching data connection. Any of
    /// caller cancellation, parent loss or a cancelled request yields
    /// `FailedToConnect`; the caller still owns the cleanup `cancel` call.
    pub async fn wait(&self, cancel: &Trigger) -> Result<Box<dyn TunnelStream>> {
        tokio::select! {
            _ = cancel.async_wait() => Err(CoreError::FailedToConnect.into()),
            _ = self.parent.async_wait() => Err(CoreError::FailedToConnect.into()),
            conn = self.slot.recv_async() => {
                conn.map_err(|_| CoreError::FailedToConnect.into())
            }
        }
    }
}

/// key id -> pool of control connections, plus the pending request table
/// correlating CONNECT commands with inbound BOUND data connections.
pub struct ConnRegistry {
    pools: RwLock<HashMap<String, Arc<Mutex<KeyPool>>>>,
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        ConnRegistry {
            pools: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a control connection. A connection with the same id replaces
    /// and closes the previous instance, anything else is appended.
    pub fn add(&self, key_id: &str, conn: Arc<dyn ControlChannel>) {
        let pool = {
            let mut pools = self.pools.write().unwrap();
            pools
                .entry(key_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(KeyPool {
                        conns: Vec::new(),
                        cursor: 0,
                    }))
                })
                .clone()
        };
        let replaced = {
            let mut pool = pool.lock().unwrap();
            match pool.conns.iter().position(|c| c.id() == conn.id()) {
                Some(idx) => {
                    let old = std::mem::replace(&mut pool.conns[idx], conn);
                    Some(old)
                }
                None => {
                    pool.conns.push(conn);
                    None
                }
            }
        };
        if let Some(old) = replaced {
            log::info!("replacing re-registered control connection {}", old.id());
            old.close();
        }
    }

    /// Remove and close a control connection; the pool itself goes away with
    /// its last entry.
    pub fn remove(&self, key_id: &str, conn_id: Uuid) {
        let mut pools = self.pools.write().unwrap();
        let Some(pool_arc) = pools.get(key_id) else {
            return;
        };
        let (removed, empty) = {
            let mut pool = pool_arc.lock().unwrap();
            let removed = pool
                .conns
                .iter()
                .position(|c| c.id() == conn_id)
                .map(|idx| pool.conns.remove(idx));
            if removed.is_some() && pool.cursor > 0 {
                pool.cursor -= 1;
            }
            (removed, pool.conns.is_empty())
        };
        if empty {
            pools.remove(key_id);
        }
        drop(pools);
        if let Some(conn) = removed {
            conn.close();
        }
    }

    /// Pick the next control connection round-robin, emit CONNECT on it and
    /// park a pending request under the fresh request id.
    pub async fn request(&self, key_id: &str) -> Result<ConnRequest> {
        let conn = {
            let pools = self.pools.read().unwrap();
            let pool_arc = pools.get(key_id).ok_or(CoreError::KeyIdNotFound)?;
            let mut pool = pool_arc.lock().unwrap();
            if pool.conns.is_empty() {
                return Err(CoreError::KeyIdNotFound.into());
            }
            let conn = pool.conns[pool.cursor % pool.conns.len()].clone();
            pool.cursor = (pool.cursor + 1) % pool.conns.len();
            conn
        };

        let request_id = Uuid::new_v4();
        let (tx, rx) = flume::bounded(1);
        self.pending.lock().unwrap().insert(
            request_id,
            PendingEntry {
                slot: tx,
                parent: conn.done(),
            },
        );
        // The pending entry exists before CONNECT goes out, so the agent can
        // never bind faster than we can correlate
        if let Err(e) = conn.send_connect(request_id).await {
            self.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }
        Ok(ConnRequest {
            id: request_id,
            slot: rx,
            parent: conn.done(),
        })
    }

    /// Hand an inbound data connection to its waiter. Without one (already
    /// cancelled, waiter gone, parent dead) the stream is dropped, which
    /// closes it.
    pub fn resolve(&self, request_id: Uuid, conn: Box<dyn TunnelStream>) {
        let entry = self.pending.lock().unwrap().remove(&request_id);
        match entry {
            Some(entry) => {
                if entry.parent.is_set() {
                    log::debug!("request {} resolved after its control connection died", request_id);
                } else if entry.slot.send(conn).is_err() {
                    log::debug!("waiter for request {} is gone", request_id);
                }
            }
            None => {
                log::debug!("no pending request {}, closing inbound data connection", request_id);
            }
        }
    }

    /// Drop a pending request; its waiter is released with a failure and a
    /// late BIND will find nothing. Unknown ids are a no-op.
    pub fn cancel(&self, request_id: Uuid) {
        self.pending.lock().unwrap().remove(&request_id);
    }

    /// Cancel everything pending and close every control connection.
    pub fn close(&self) {
        self.pending.lock().unwrap().clear();
        let pools: Vec<_> = self.pools.write().unwrap().drain().collect();
        for (_, pool) in pools {
            let conns = std::mem::take(&mut pool.lock().unwrap().conns);
            for conn in conns {
                conn.close();
            }
        }
    }

    pub fn live_connections(&self, key_id: &str) -> usize {
        self.pools
            .read()
            .unwrap()
            .get(key_id)
            .map(|pool| pool.lock().unwrap().conns.len())
            .unwrap_or(0)
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        ConnRegistry::new()
    }
}
