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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use shared::{
    consts::DIAL_TIMEOUT_MS,
    errors::CoreError,
    log,
    protocol::{self, Command, EventFrame, TunnelStream, handshake},
    system::trigger::Trigger,
    token::Token,
};

use crate::{
    config::ClientConfig,
    consts::{RECONNECT_INITIAL_MS, RECONNECT_MAX_MS},
};

mod bind;
mod verifier;

/// The agent side of the tunnel: one long-lived registered control
/// connection receiving CONNECT/PING/EVENT, plus one short-lived bound data
/// connection per public request, bridged to the local origin.
#[derive(Clone)]
pub struct TunnelAgent {
    config: ClientConfig,
    token: Token,
}

impl TunnelAgent {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let token = Token::decode(&config.token)?;
        Ok(TunnelAgent { config, token })
    }

    /// Keep a control connection up until `stop` fires, reconnecting with
    /// exponential backoff after failures.
    pub async fn run(&self, stop: Trigger) -> Result<()> {
        let mut backoff = Duration::from_millis(RECONNECT_INITIAL_MS);
        loop {
            if stop.is_set() {
                return Ok(());
            }
            match self.run_control(&stop).await {
                Ok(()) => {
                    if stop.is_set() {
                        return Ok(());
                    }
                    log::info!("broker closed the control connection");
                    backoff = Duration::from_millis(RECONNECT_INITIAL_MS);
                }
                Err(e) => {
                    log::warn!("control connection failed: {:#}", e);
                }
            }
            log::info!("reconnecting in {}s", backoff.as_secs());
            tokio::select! {
                _ = stop.async_wait() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_millis(RECONNECT_MAX_MS));
        }
    }

    /// One full control connection: dial, authenticate, declare REGISTER,
    /// then dispatch commands until the broker goes away.
    async fn run_control(&self, stop: &Trigger) -> Result<()> {
        let mut stream = self.connect().await?;
        handshake::open_control(&mut stream, &self.token.id, &self.token.secret).await?;
        log::info!("registered with the broker as {}", self.token.id);

        loop {
            let cmd = tokio::select! {
                _ = stop.async_wait() => return Ok(()),
                cmd = protocol::read_command(&mut stream) => match cmd {
                    Ok(cmd) => cmd,
                    Err(e) if is_clean_close(&e) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            match cmd {
                Command::Ping => {
                    protocol::write_command(&mut stream, Command::Pong).await?;
                }
                Command::Connect => {
                    let request_id = protocol::read_request_id(&mut stream).await?;
                    log::debug!("connect requested, opening data connection {}", request_id);
                    let agent = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = agent.run_bind(request_id).await {
                            log::warn!("data connection {} failed: {:#}", request_id, e);
                        }
                    });
                }
                Command::Event => {
                    let event: EventFrame = protocol::read_payload(&mut stream).await?;
                    match event.name.as_str() {
                        "urlToConnectUpdated" => {
                            log::info!(
                                "service published at {}",
                                event.payload.as_str().unwrap_or("<unknown>")
                            );
                        }
                        name => log::debug!("ignoring event {}", name),
                    }
                }
                other => {
                    return Err(CoreError::ProtocolError(format!(
                        "unexpected {:?} on the control connection",
                        other
                    ))
                    .into());
                }
            }
        }
    }

    /// Dial the broker, with TLS (SNI = broker host, TLS 1.3 only) when
    /// configured.
    pub(crate) async fn connect(&self) -> Result<Box<dyn TunnelStream>> {
        let addr = format!("{}:{}", self.config.broker.host, self.config.broker.port);
        let socket = tokio::time::timeout(
            Duration::from_millis(DIAL_TIMEOUT_MS),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| anyhow::anyhow!("dialing {} timed out", addr))??;
        let _ = socket.set_nodelay(true);

        if !self.config.tls.enabled {
            return Ok(Box::new(socket));
        }

        let connector = TlsConnector::from(Arc::new(verifier::client_config(&self.config.tls)?));
        let server_name = self
            .config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| self.config.broker.host.clone());
        let server_name = rustls::pki_types::ServerName::try_from(server_name)
            .map_err(|e| anyhow::anyhow!("invalid tls server name: {}", e))?;
        let stream = connector.connect(server_name, socket).await?;
        Ok(Box::new(stream))
    }
}

fn is_clean_close(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| {
            matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use shared::protocol::handshake::{TunnelRole, accept_tunnel};
    use shared::protocol::{ClientConnMeta, write_frame, write_request_id};
    use shared::token::TokenType;

    use crate::config::BrokerConfig;

    fn agent_for(broker_port: u16, origin: &str, token: &Token) -> TunnelAgent {
        let config = ClientConfig {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: broker_port,
            },
            token: token.encode(),
            origin: origin.to_string(),
            tls: Default::default(),
            log_level: None,
        };
        TunnelAgent::new(config).unwrap()
    }

    async fn accept_as(
        listener: &TcpListener,
        token: &Token,
    ) -> (tokio::net::TcpStream, TunnelRole) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let expected_id = token.id.clone();
        let expected_secret = token.secret.clone();
        let role = accept_tunnel(&mut socket, |key_id, secret| async move {
            Ok(key_id == expected_id && secret == expected_secret)
        })
        .await
        .unwrap();
        (socket, role)
    }

    #[tokio::test]
    async fn test_agent_serves_one_proxied_request() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_port = broker.local_addr().unwrap().port();

        // Stub origin answering a fixed response to whatever comes in
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let token = Token::generate(TokenType::Web, Some("acme")).unwrap();
        let agent = agent_for(broker_port, &origin_addr, &token);
        let stop = Trigger::new();
        let agent_task = {
            let agent = agent.clone();
            let stop = stop.clone();
            tokio::spawn(async move { agent.run(stop).await })
        };

        // The agent registers a control connection
        let (mut ctrl, role) = accept_as(&broker, &token).await;
        assert!(matches!(role, TunnelRole::Registered { ref key_id } if key_id == "acme"));

        // Health ping round-trip
        protocol::write_command(&mut ctrl, Command::Ping).await.unwrap();
        assert_eq!(protocol::read_command(&mut ctrl).await.unwrap(), Command::Pong);

        // URL event is consumed without breaking the loop
        write_frame(
            &mut ctrl,
            Command::Event,
            &EventFrame {
                name: "urlToConnectUpdated".to_string(),
                payload: serde_json::json!("http://acme.test.local"),
            },
        )
        .await
        .unwrap();

        // CONNECT brings up a bound data connection with the same request id
        let request_id = Uuid::new_v4();
        write_request_id(&mut ctrl, Command::Connect, request_id).await.unwrap();

        let (mut data, role) = accept_as(&broker, &token).await;
        match role {
            TunnelRole::Bound { request_id: bound, .. } => assert_eq!(bound, request_id),
            other => panic!("expected Bound, got {:?}", other),
        }

        // Metadata, then the buffered request, then the spliced response
        protocol::write_meta(&mut data, &ClientConnMeta { ip: "203.0.113.9".to_string() })
            .await
            .unwrap();
        data.write_all(b"GET / HTTP/1.1\r\nHost: acme.test.local\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), data.read_to_end(&mut response))
            .await
            .expect("response must arrive")
            .unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hello"));

        stop.set();
        drop(ctrl);
        agent_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_broker_close_ends_control_cleanly() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_port = broker.local_addr().unwrap().port();
        let token = Token::generate(TokenType::Web, None).unwrap();
        let agent = agent_for(broker_port, "127.0.0.1:1", &token);

        let stop = Trigger::new();
        let control = {
            let agent = agent.clone();
            let stop = stop.clone();
            tokio::spawn(async move { agent.run_control(&stop).await })
        };

        let (ctrl, _role) = accept_as(&broker, &token).await;
        drop(ctrl);

        // A closed broker is a clean return, the reconnect loop handles it
        control.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_malformed_token() {
        let config = ClientConfig {
            token: "definitely-not-base64!".to_string(),
            ..Default::default()
        };
        assert!(TunnelAgent::new(config).is_err());
    }
}
