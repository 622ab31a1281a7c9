use anyhow::Result;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::CoreError;

mod command;
pub mod consts;
pub mod handshake;
pub mod proxy;

pub use command::Command;

/// The byte streams the tunnel moves around: plain TCP or TLS, boxed so both
/// sides of the broker handle them uniformly.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> TunnelStream for T {}

/// Client metadata sent ahead of the relayed request on every data connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnMeta {
    pub ip: String,
}

/// In-band custom event, broker to agent, on registered control connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub name: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    pub key_id: String,
    pub secret: String,
}

pub async fn write_command<W>(writer: &mut W, cmd: Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[cmd.into()]).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(Command::from(buf[0]))
}

/// Write a command followed by a u16 length prefixed JSON payload.
pub async fn write_frame<W, T>(writer: &mut W, cmd: Command, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(&[cmd.into()]).await?;
    write_payload(writer, payload).await
}

/// Write a u16 length prefixed JSON payload without a leading command byte.
pub async fn write_payload<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(payload)?;
    if body.len() > consts::MAX_FRAME_PAYLOAD {
        return Err(CoreError::ProtocolError(format!(
            "payload of {} bytes exceeds the frame limit",
            body.len()
        ))
        .into());
    }
    writer.write_all(&(body.len() as u16).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_payload<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| CoreError::ProtocolError(format!("malformed json payload: {}", e)).into())
}

pub async fn write_request_id<W>(writer: &mut W, cmd: Command, request_id: Uuid) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[cmd.into()]).await?;
    writer.write_all(request_id.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_request_id<R>(reader: &mut R) -> Result<Uuid>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf).await?;
    Ok(Uuid::from_bytes(buf))
}

pub async fn write_meta<W>(writer: &mut W, meta: &ClientConnMeta) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_payload(writer, meta).await
}

pub async fn read_meta<R>(reader: &mut R) -> Result<ClientConnMeta>
where
    R: AsyncRead + Unpin,
{
    read_payload(reader).await
}
