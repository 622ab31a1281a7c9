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
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, RwLock},
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use uuid::Uuid;

use shared::{
    consts::PING_INTERVAL_MS,
    errors::CoreError,
    log,
    protocol::{
        self, ClientConnMeta, Command, EventFrame, TunnelStream,
        handshake::{self, TunnelRole},
    },
    relay,
    system::trigger::Trigger,
};

use crate::{
    auth::AuthRepo,
    consts::{HANDSHAKE_TIMEOUT_MS, PONG_TIMEOUT_MS},
    registry::{ConnRegistry, ControlChannel},
};

pub const URL_UPDATED_EVENT: &str = "urlToConnectUpdated";

pub type EndpointGenerator = Box<dyn Fn(&str) -> String + Send + Sync>;

/// A registered agent control connection. Writes are serialised through the
/// writer lock; the reader half only ever carries PONG replies.
pub struct ControlConnection {
    id: Uuid,
    key_id: String,
    reader: tokio::sync::Mutex<ReadHalf<Box<dyn TunnelStream>>>,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn TunnelStream>>>,
    done: Trigger,
}

impl ControlConnection {
    pub fn new(key_id: String, stream: Box<dyn TunnelStream>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        ControlConnection {
            id: Uuid::new_v4(),
            key_id,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            done: Trigger::new(),
        }
    }
}

#[async_trait::async_trait]
impl ControlChannel for ControlConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn done(&self) -> Trigger {
        self.done.clone()
    }

    async fn send_connect(&self, request_id: Uuid) -> Result<()> {
        let mut writer = self.writer.lock().await;
        protocol::write_request_id(&mut *writer, Command::Connect, request_id).await
    }

    /// One PING/PONG exchange. The agent sends nothing on its own over the
    /// control connection, so the next inbound byte is the reply.
    async fn send_ping(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            protocol::write_command(&mut *writer, Command::Ping).await?;
        }
        let mut reader = self.reader.lock().await;
        let cmd = tokio::time::timeout(
            Duration::from_millis(PONG_TIMEOUT_MS),
            protocol::read_command(&mut *reader),
        )
        .await
        .map_err(|_| anyhow::anyhow!("ping timed out"))??;
        if cmd != Command::Pong {
            return Err(CoreError::ProtocolError(format!(
                "expected Pong, got {:?}",
                cmd
            ))
            .into());
        }
        Ok(())
    }

    async fn send_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        protocol::write_frame(
            &mut *writer,
            Command::Event,
            &EventFrame {
                name: name.to_string(),
                payload,
            },
        )
        .await
    }

    fn close(&self) {
        self.done.set();
    }
}

/// Wrapper handed to the waiter of a pending request. The BOUND connection
/// handler parks on `done` until the waiter drops the stream.
#[derive(Debug)]
struct NotifyOnClose {
    inner: Box<dyn TunnelStream>,
    done: Trigger,
}

impl NotifyOnClose {
    fn new(inner: Box<dyn TunnelStream>, done: Trigger) -> Self {
        NotifyOnClose { inner, done }
    }
}

impl AsyncRead for NotifyOnClose {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for NotifyOnClose {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for NotifyOnClose {
    fn drop(&mut self) {
        self.done.set();
    }
}

/// Glue between the tunnel listener, the registry and the edge: drives the
/// handshake state machine, keeps control connections healthy and runs the
/// public-request splice.
pub struct BrokerService {
    registry: Arc<ConnRegistry>,
    auth: Arc<AuthRepo>,
    endpoint: RwLock<EndpointGenerator>,
}

impl BrokerService {
    pub fn new(registry: Arc<ConnRegistry>, auth: Arc<AuthRepo>) -> Self {
        BrokerService {
            registry,
            auth,
            endpoint: RwLock::new(Box::new(|key_id| format!("http://{}.localhost", key_id))),
        }
    }

    /// The public URL announced to agents: `schema://<key>.<domain>[:port]`.
    pub fn set_endpoint_generator(&self, generator: EndpointGenerator) {
        *self.endpoint.write().unwrap() = generator;
    }

    pub fn registry(&self) -> Arc<ConnRegistry> {
        self.registry.clone()
    }

    /// Drive an accepted tunnel connection to its terminal role, then serve
    /// it: REGISTERED connections join the registry and get health pings,
    /// BOUND connections are delivered to their pending request.
    pub async fn handle_reverse_conn(
        &self,
        mut stream: Box<dyn TunnelStream>,
        peer: SocketAddr,
        shutdown: Trigger,
    ) -> Result<()> {
        let auth = self.auth.clone();
        let role = tokio::time::timeout(
            Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            handshake::accept_tunnel(&mut stream, |key_id, secret| async move {
                auth.verify(&key_id, &secret).await
            }),
        )
        .await
        .map_err(|_| CoreError::ProtocolError(format!("handshake timed out for {}", peer)))??;

        match role {
            TunnelRole::Registered { key_id } => self.run_control(stream, key_id, shutdown).await,
            TunnelRole::Bound { request_id, .. } => self.run_bound(stream, request_id).await,
        }
    }

    async fn run_control(
        &self,
        stream: Box<dyn TunnelStream>,
        key_id: String,
        shutdown: Trigger,
    ) -> Result<()> {
        let ctrl = Arc::new(ControlConnection::new(key_id.clone(), stream));
        let conn_id = ctrl.id();
        let done = ctrl.done();

        // The URL event goes out before the pool add, so a request racing in
        // right after registration can never beat the announcement
        let url = (self.endpoint.read().unwrap())(&key_id);
        ctrl.send_event(URL_UPDATED_EVENT, serde_json::Value::String(url)).await?;
        self.registry.add(&key_id, ctrl.clone());
        log::info!("agent {} registered control connection {}", key_id, conn_id);

        let mut ticker = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.async_wait() => break,
                _ = done.async_wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = ctrl.send_ping().await {
                        log::info!("control connection {} of {} went offline: {:#}", conn_id, key_id, e);
                        break;
                    }
                }
            }
        }

        // Whatever ended the loop, the connection leaves the pool
        self.registry.remove(&key_id, conn_id);
        Ok(())
    }

    async fn run_bound(&self, stream: Box<dyn TunnelStream>, request_id: Uuid) -> Result<()> {
        let closed = Trigger::new();
        let wrapped = NotifyOnClose::new(stream, closed.clone());
        self.registry.resolve(request_id, Box::new(wrapped));
        // Parked until the waiter is done with the stream; an undeliverable
        // stream was dropped inside resolve and releases us immediately
        closed.async_wait().await;
        Ok(())
    }

    /// Bridge one hijacked public request to the agent behind `key_id`.
    /// Early failures leave `client` untouched so the edge can still write
    /// an error response onto it.
    pub async fn handle_http(
        &self,
        key_id: &str,
        client: &mut Box<dyn TunnelStream>,
        preamble: &[u8],
        client_ip: &str,
        cancel: &Trigger,
    ) -> Result<()> {
        let req = match self.registry.request(key_id).await {
            Ok(req) => req,
            Err(e) => {
                return Err(match e.downcast_ref::<CoreError>() {
                    Some(CoreError::KeyIdNotFound) => {
                        // A known key with no live agents and an unknown key
                        // both end up as 404; a broken auth store must not
                        match self.auth.is_key_exists(key_id).await {
                            Ok(true) => {
                                log::info!("key {} exists but its agent is offline", key_id);
                                CoreError::KeyIdNotFound.into()
                            }
                            Ok(false) => CoreError::KeyIdNotFound.into(),
                            Err(e) => {
                                log::error!("auth store lookup for {} failed: {:#}", key_id, e);
                                CoreError::FailedToConnect.into()
                            }
                        }
                    }
                    _ => {
                        log::warn!("dispatch for {} failed: {:#}", key_id, e);
                        CoreError::FailedToConnect.into()
                    }
                });
            }
        };

        let mut data = match req.wait(cancel).await {
            Ok(data) => data,
            Err(_) => {
                self.registry.cancel(req.id);
                return Err(CoreError::FailedToConnect.into());
            }
        };

        // Client metadata and the buffered request head go ahead of the splice
        let send_preamble = async {
            protocol::write_meta(&mut data, &ClientConnMeta { ip: client_ip.to_string() }).await?;
            data.write_all(preamble).await?;
            data.flush().await?;
            Ok::<(), anyhow::Error>(())
        };
        if let Err(e) = send_preamble.await {
            log::warn!("request {} lost its data connection: {:#}", req.id, e);
            return Err(CoreError::FailedToConnect.into());
        }

        let parent = req.parent();
        tokio::select! {
            // Control connection loss force-closes the data connection (drop)
            _ = parent.async_wait() => Err(CoreError::FailedToConnect.into()),
            result = relay::splice(&mut *client, &mut data, cancel) => result.map(|_| ()),
        }
    }
}
