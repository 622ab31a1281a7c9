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

use std::future::Future;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::CoreError;

use super::{
    AuthFrame, Command, consts::TUNNEL_V1_SIGNATURE, read_command, read_payload, read_request_id,
    write_command, write_frame, write_request_id,
};

// Tunnel connection states:
//   INIT -> AWAIT_AUTH -> AUTHENTICATED -> { REGISTERED | BOUND } -> CLOSED
// Any malformed frame, bad signature, auth failure or unexpected transition
// closes the connection without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    AwaitAuth,
    Authenticated,
    Registered,
    Bound,
    Closed,
}

/// Terminal role a tunnel connection reaches after a successful handshake.
#[derive(Debug)]
pub enum TunnelRole {
    Registered { key_id: String },
    Bound { key_id: String, request_id: Uuid },
}

fn unexpected(cmd: Command, state: ConnState) -> anyhow::Error {
    CoreError::ProtocolError(format!("unexpected {:?} in state {:?}", cmd, state)).into()
}

/// Broker side of the handshake. Drives an accepted tunnel connection from
/// INIT until it declares its role. `authenticate` is the `(key_id, secret)`
/// capability of the auth repository.
pub async fn accept_tunnel<S, F, Fut>(stream: &mut S, authenticate: F) -> Result<TunnelRole>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(String, String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut signature = [0u8; TUNNEL_V1_SIGNATURE.len()];
    stream.read_exact(&mut signature).await?;
    if signature != *TUNNEL_V1_SIGNATURE {
        return Err(CoreError::ProtocolError("invalid tunnel signature".to_string()).into());
    }

    let cmd = read_command(stream).await?;
    if cmd != Command::Auth {
        return Err(unexpected(cmd, ConnState::AwaitAuth));
    }
    let auth: AuthFrame = read_payload(stream).await?;
    if !authenticate(auth.key_id.clone(), auth.secret).await? {
        return Err(CoreError::AuthFailed.into());
    }

    let cmd = read_command(stream).await?;
    match cmd {
        Command::Register => Ok(TunnelRole::Registered { key_id: auth.key_id }),
        Command::Bind => {
            let request_id = read_request_id(stream).await?;
            Ok(TunnelRole::Bound {
                key_id: auth.key_id,
                request_id,
            })
        }
        other => Err(unexpected(other, ConnState::Authenticated)),
    }
}

/// Agent side: authenticate and declare this connection a control connection.
pub async fn open_control<S>(stream: &mut S, key_id: &str, secret: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(TUNNEL_V1_SIGNATURE).await?;
    write_frame(
        stream,
        Command::Auth,
        &AuthFrame {
            key_id: key_id.to_string(),
            secret: secret.to_string(),
        },
    )
    .await?;
    write_command(stream, Command::Register).await
}

/// Agent side: authenticate and bind this connection to a pending request.
pub async fn open_data<S>(stream: &mut S, key_id: &str, secret: &str, request_id: Uuid) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(TUNNEL_V1_SIGNATURE).await?;
    write_frame(
        stream,
        Command::Auth,
        &AuthFrame {
            key_id: key_id.to_string(),
            secret: secret.to_string(),
        },
    )
    .await?;
    write_request_id(stream, Command::Bind, request_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn accept_ok(stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<TunnelRole> {
        accept_tunnel(stream, |key_id, secret| async move {
            Ok(key_id == "acme" && secret == "s3cret")
        })
        .await
    }

    #[tokio::test]
    async fn test_register_handshake() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        open_control(&mut agent, "acme", "s3cret").await.unwrap();
        match accept_ok(&mut broker).await.unwrap() {
            TunnelRole::Registered { key_id } => assert_eq!(key_id, "acme"),
            other => panic!("expected Registered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_handshake() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        let request_id = Uuid::new_v4();
        open_data(&mut agent, "acme", "s3cret", request_id).await.unwrap();
        match accept_ok(&mut broker).await.unwrap() {
            TunnelRole::Bound { key_id, request_id: bound } => {
                assert_eq!(key_id, "acme");
                assert_eq!(bound, request_id);
            }
            other => panic!("expected Bound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_signature_is_protocol_error() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        agent.write_all(b"GARBAGE!").await.unwrap();
        let err = accept_ok(&mut broker).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_auth_failure() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        open_control(&mut agent, "acme", "wrong").await.unwrap();
        let err = accept_ok(&mut broker).await.unwrap_err();
        assert_eq!(err.downcast_ref::<CoreError>(), Some(&CoreError::AuthFailed));
    }

    #[tokio::test]
    async fn test_role_must_follow_auth() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        agent.write_all(TUNNEL_V1_SIGNATURE).await.unwrap();
        write_command(&mut agent, Command::Register).await.unwrap();
        let err = accept_ok(&mut broker).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_is_not_a_role() {
        let (mut agent, mut broker) = tokio::io::duplex(1024);
        agent.write_all(TUNNEL_V1_SIGNATURE).await.unwrap();
        write_frame(
            &mut agent,
            Command::Auth,
            &AuthFrame { key_id: "acme".to_string(), secret: "s3cret".to_string() },
        )
        .await
        .unwrap();
        write_command(&mut agent, Command::Ping).await.unwrap();
        let err = accept_ok(&mut broker).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ProtocolError(_))
        ));
    }
}
