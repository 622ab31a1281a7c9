use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use uuid::Uuid;

use shared::{
    consts::DIAL_TIMEOUT_MS,
    log,
    protocol::{self, handshake},
    relay,
    system::trigger::Trigger,
};

use super::TunnelAgent;

impl TunnelAgent {
    /// Answer one CONNECT: open a fresh tunnel connection, authenticate,
    /// bind it to the request, read the client metadata, dial the origin and
    /// splice until either side is done.
    pub(crate) async fn run_bind(&self, request_id: Uuid) -> Result<()> {
        let mut stream = self.connect().await?;
        handshake::open_data(&mut stream, &self.token.id, &self.token.secret, request_id).await?;

        let meta = protocol::read_meta(&mut stream).await?;
        log::debug!("request {} from client {}", request_id, meta.ip);

        let mut origin = tokio::time::timeout(
            Duration::from_millis(DIAL_TIMEOUT_MS),
            TcpStream::connect(&self.config.origin),
        )
        .await
        .map_err(|_| anyhow::anyhow!("dialing origin {} timed out", self.config.origin))??;
        let _ = origin.set_nodelay(true);

        let (from_broker, from_origin) =
            relay::splice(&mut stream, &mut origin, &Trigger::new()).await?;
        log::debug!(
            "request {} done, {} bytes in, {} bytes out",
            request_id,
            from_broker,
            from_origin
        );
        Ok(())
    }
}
