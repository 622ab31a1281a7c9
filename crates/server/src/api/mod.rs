// Management API: token issuance and revocation plus a health probe. Served
// with the same minimal HTTP plumbing as the edge, on its own listener, which
// is expected to stay private.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

use shared::{
    errors::CoreError,
    log,
    protocol::TunnelStream,
    system::trigger::Trigger,
    token::{self, TokenType},
};

use crate::{
    auth::AuthRepo,
    consts::{DEFAULT_TOKEN_TTL_SECS, HTTP_HEAD_TIMEOUT_MS},
    edge::http::{self, RequestHead},
};

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Default, Deserialize)]
struct TokenRequest {
    key_id: Option<String>,
    ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    key_id: String,
    ttl: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub struct ApiServer {
    auth: Arc<AuthRepo>,
}

impl ApiServer {
    pub fn new(auth: Arc<AuthRepo>) -> Self {
        ApiServer { auth }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, stop: Trigger) -> Result<()> {
        log::info!("management api listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = stop.async_wait() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let api = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = api.handle_conn(socket, peer).await {
                                    log::debug!("api connection from {} ended: {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("failed to accept api connection: {:?}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, socket: TcpStream, _peer: SocketAddr) -> Result<()> {
        let mut stream: Box<dyn TunnelStream> = Box::new(socket);
        let raw = tokio::time::timeout(
            Duration::from_millis(HTTP_HEAD_TIMEOUT_MS),
            http::read_request_head(&mut stream),
        )
        .await
        .map_err(|_| anyhow::anyhow!("request head timed out"))??;
        let req = RequestHead::parse(raw)?;
        self.route(&mut stream, req).await
    }

    async fn route(&self, stream: &mut Box<dyn TunnelStream>, req: RequestHead) -> Result<()> {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/health") => {
                write_json(stream, 200, &serde_json::json!({"status": "healthy"})).await
            }
            ("POST", "/token") => self.create_token(stream, &req).await,
            ("DELETE", path) if path.starts_with("/token/") => {
                let key_id = &path["/token/".len()..];
                if key_id.is_empty() {
                    return not_found(stream).await;
                }
                self.auth.delete_token(key_id).await?;
                http::write_response(stream, 204, JSON_CONTENT_TYPE, &[], b"").await
            }
            _ => not_found(stream).await,
        }
    }

    async fn create_token(
        &self,
        stream: &mut Box<dyn TunnelStream>,
        req: &RequestHead,
    ) -> Result<()> {
        let body = http::read_body(stream, req).await?;
        let request: TokenRequest = if body.is_empty() {
            TokenRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(e) => return bad_request(stream, &format!("malformed body: {}", e)).await,
            }
        };

        if let Some(key_id) = &request.key_id
            && !token::is_valid_id(key_id)
        {
            return bad_request(stream, "invalid key id").await;
        }
        let ttl_secs = request.ttl.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        if ttl_secs == 0 {
            return bad_request(stream, "ttl must be positive").await;
        }

        match self
            .auth
            .issue(
                TokenType::Web,
                request.key_id.as_deref(),
                Duration::from_secs(ttl_secs),
            )
            .await
        {
            Ok(issued) => {
                let response = TokenResponse {
                    token: issued.encode(),
                    key_id: issued.id,
                    ttl: ttl_secs,
                };
                write_json(stream, 200, &serde_json::to_value(response)?).await
            }
            Err(e)
                if matches!(
                    e.downcast_ref::<CoreError>(),
                    Some(CoreError::DuplicateTokenId | CoreError::FailedToGenerateUniqueToken)
                ) =>
            {
                write_json(
                    stream,
                    409,
                    &serde_json::to_value(ErrorResponse { error: e.to_string() })?,
                )
                .await
            }
            Err(e) => {
                log::error!("token issuance failed: {:#}", e);
                write_json(
                    stream,
                    500,
                    &serde_json::to_value(ErrorResponse { error: "internal error".to_string() })?,
                )
                .await
            }
        }
    }
}

async fn write_json(
    stream: &mut Box<dyn TunnelStream>,
    status: u16,
    value: &serde_json::Value,
) -> Result<()> {
    http::write_response(
        stream,
        status,
        JSON_CONTENT_TYPE,
        &[],
        serde_json::to_vec(value)?.as_slice(),
    )
    .await
}

async fn bad_request(stream: &mut Box<dyn TunnelStream>, message: &str) -> Result<()> {
    write_json(
        stream,
        400,
        &serde_json::json!({"error": message}),
    )
    .await
}

async fn not_found(stream: &mut Box<dyn TunnelStream>) -> Result<()> {
    write_json(stream, 404, &serde_json::json!({"error": "not found"})).await
}
