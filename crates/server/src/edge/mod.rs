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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use shared::{
    errors::CoreError,
    log,
    protocol::{TunnelStream, proxy::ProxyHeader},
    system::trigger::Trigger,
};

use crate::{
    consts::{HTTP_HEAD_TIMEOUT_MS, PROXY_HEAD_TIMEOUT_MS},
    service::BrokerService,
};

pub mod client_ip;
pub mod consent;
pub mod http;
pub mod limiter;
pub mod templates;

use limiter::ConnLimiter;

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub domain_suffix: String, // always with a leading dot
    pub max_conns_per_key: usize,
    pub use_proxy_protocol: bool,
}

impl EdgeConfig {
    pub fn new(domain: &str, max_conns_per_key: usize, use_proxy_protocol: bool) -> Self {
        let domain_suffix = if domain.starts_with('.') {
            domain.to_string()
        } else {
            format!(".{}", domain)
        };
        EdgeConfig {
            domain_suffix,
            max_conns_per_key,
            use_proxy_protocol,
        }
    }
}

/// The left-most label of `host` once the public suffix is stripped. Hosts
/// outside the suffix, or with nothing in front of it, select nobody.
pub fn parse_key_id(host: Option<&str>, suffix: &str) -> Option<String> {
    let stripped = host?.strip_suffix(suffix)?;
    let label = stripped.split('.').next()?;
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

/// Public HTTP listener. Each accepted connection reads one request head,
/// walks the gate/parse/limit/client-ip chain and then hands the hijacked
/// socket to the broker service for splicing.
pub struct EdgeServer {
    service: Arc<BrokerService>,
    limiter: ConnLimiter,
    config: EdgeConfig,
}

impl EdgeServer {
    pub fn new(service: Arc<BrokerService>, config: EdgeConfig) -> Self {
        EdgeServer {
            service,
            limiter: ConnLimiter::new(config.max_conns_per_key),
            config,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, stop: Trigger) -> Result<()> {
        log::info!("edge listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = stop.async_wait() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let edge = self.clone();
                            let stop = stop.clone();
                            tokio::spawn(async move {
                                if let Err(e) = edge.handle_conn(socket, peer, stop).await {
                                    log::debug!("edge connection from {} ended: {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("failed to accept edge connection: {:?}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_conn(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        stop: Trigger,
    ) -> Result<()> {
        let _ = socket.set_nodelay(true);
        let mut stream: Box<dyn TunnelStream> = Box::new(socket);

        let peer = if self.config.use_proxy_protocol {
            tokio::time::timeout(
                Duration::from_millis(PROXY_HEAD_TIMEOUT_MS),
                ProxyHeader::read_from_stream(&mut stream),
            )
            .await
            .map_err(|_| anyhow::anyhow!("PROXY preamble timed out"))??
            .source_addr
        } else {
            peer
        };

        let raw = tokio::time::timeout(
            Duration::from_millis(HTTP_HEAD_TIMEOUT_MS),
            http::read_request_head(&mut stream),
        )
        .await
        .map_err(|_| anyhow::anyhow!("request head timed out"))??;
        let req = http::RequestHead::parse(raw)?;

        self.dispatch(stream, req, peer, stop).await
    }

    async fn dispatch(
        &self,
        mut stream: Box<dyn TunnelStream>,
        req: http::RequestHead,
        peer: SocketAddr,
        stop: Trigger,
    ) -> Result<()> {
        match consent::check(&req) {
            Some(consent::Gate::ShowForm) => return consent::show_form(&mut stream, &req).await,
            Some(consent::Gate::HandlePost) => {
                return consent::handle_post(&mut stream, &req).await;
            }
            None => {}
        }

        let Some(key_id) = parse_key_id(req.host(), &self.config.domain_suffix) else {
            return http::write_response(
                &mut stream,
                404,
                templates::HTML_CONTENT_TYPE,
                &[],
                templates::NOT_FOUND_HTML.as_bytes(),
            )
            .await;
        };

        let request_id = Uuid::new_v4();
        log::info!(
            key_id = %key_id,
            request_id = %request_id,
            method = %req.method,
            "edge request"
        );

        let Some(_guard) = self.limiter.acquire(&key_id) else {
            log::info!(key_id = %key_id, "per key connection limit hit");
            return http::write_response(
                &mut stream,
                429,
                templates::HTML_CONTENT_TYPE,
                &[],
                templates::TOO_MANY_REQUESTS_TEXT.as_bytes(),
            )
            .await;
        };

        let client_ip = client_ip::resolve(&req, peer);

        match self
            .service
            .handle_http(&key_id, &mut stream, &req.raw, &client_ip, &stop)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<CoreError>() {
                Some(CoreError::KeyIdNotFound) => {
                    http::write_response(
                        &mut stream,
                        404,
                        templates::HTML_CONTENT_TYPE,
                        &[],
                        templates::NOT_FOUND_HTML.as_bytes(),
                    )
                    .await
                }
                Some(CoreError::FailedToConnect) => {
                    http::write_response(
                        &mut stream,
                        502,
                        templates::HTML_CONTENT_TYPE,
                        &[],
                        templates::BAD_GATEWAY_HTML.as_bytes(),
                    )
                    .await
                }
                Some(CoreError::Cancelled) => Ok(()),
                _ => {
                    log::error!(request_id = %request_id, "request failed: {:#}", e);
                    Ok(())
                }
            },
        }
    }
}
