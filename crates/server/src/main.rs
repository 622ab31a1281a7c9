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

use std::{path::Path, sync::Arc};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::{net::TcpListener, signal};

use shared::{log, system::trigger::Trigger};

use pubtunnel_server::{
    Broker,
    auth::{KvStorage, MemoryStorage, RedisStorage},
    config::{self, ServerConfig},
    consts::DEFAULT_LOG_LEVEL,
    tls::TlsReloader,
};

// Catch SIGTERM and SIGINT to perform a graceful shutdown
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = { config::get().read().unwrap().clone() };
    log::setup_logging(
        config.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL),
        log::LogType::Server,
    );

    if let Err(e) = run(config).await {
        log::error!("startup failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let storage: Arc<dyn KvStorage> = match &config.auth.storage_url {
        Some(url) => Arc::new(RedisStorage::connect(url).await?),
        None => {
            log::warn!("no auth.storage_url configured, tokens live in process memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let tls = match (&config.tunnel.cert_path, &config.tunnel.key_path) {
        (Some(cert), Some(key)) => {
            Some(Arc::new(TlsReloader::new(Path::new(cert), Path::new(key))?))
        }
        (None, None) => None,
        _ => anyhow::bail!("tunnel.cert_path and tunnel.key_path must be set together"),
    };

    let edge_listener = TcpListener::bind(&config.http.listen).await?;
    let tunnel_listener = TcpListener::bind(&config.tunnel.listen).await?;
    let api_listener = match &config.api.listen {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };

    let stop = Trigger::new();

    // Spawn the signal handler
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            let ctrl_c = signal::ctrl_c();
            #[cfg(unix)]
            let mut terminate =
                unix_signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

            #[cfg(unix)]
            tokio::select! {
                _ = ctrl_c => {
                    log::info!("Received Ctrl-C, shutting down");
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM, shutting down");
                }
            }
            #[cfg(not(unix))]
            {
                ctrl_c.await.expect("Failed to listen for Ctrl-C");
                log::info!("Received Ctrl-C, shutting down");
            }
            stop.set();
        });
    }

    let broker = Broker::new(storage, config);
    broker
        .serve(edge_listener, tunnel_listener, api_listener, tls, stop)
        .await
}
