use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use shared::{log, protocol::TunnelStream, system::trigger::Trigger};

pub mod api;
pub mod auth;
pub mod config;
pub mod consts;
pub mod edge;
pub mod registry;
pub mod service;
pub mod tls;

use api::ApiServer;
use auth::{AuthRepo, KvStorage};
use config::ServerConfig;
use edge::{EdgeConfig, EdgeServer};
use registry::ConnRegistry;
use service::BrokerService;
use tls::TlsReloader;

/// The assembled broker: auth repository, connection registry, broker
/// service and edge, wired from one config. `main` runs exactly this; tests
/// run it on ephemeral listeners.
pub struct Broker {
    pub service: Arc<BrokerService>,
    pub registry: Arc<ConnRegistry>,
    pub auth: Arc<AuthRepo>,
    config: ServerConfig,
}

impl Broker {
    pub fn new(storage: Arc<dyn KvStorage>, config: ServerConfig) -> Self {
        let auth = Arc::new(AuthRepo::new(
            storage,
            &config.auth.salt,
            &config.auth.key_prefix,
        ));
        let registry = Arc::new(ConnRegistry::new());
        let service = Arc::new(BrokerService::new(registry.clone(), auth.clone()));

        let schema = config.http.schema.clone();
        let domain = config.http.domain.trim_start_matches('.').to_string();
        let port = config.http.public_port;
        service.set_endpoint_generator(Box::new(move |key_id| match port {
            Some(port) => format!("{}://{}.{}:{}", schema, key_id, domain, port),
            None => format!("{}://{}.{}", schema, key_id, domain),
        }));

        Broker {
            service,
            registry,
            auth,
            config,
        }
    }

    /// Serve until `stop` fires: the public edge, the reverse tunnel and,
    /// when a listener is given, the management API.
    pub async fn serve(
        &self,
        edge_listener: TcpListener,
        tunnel_listener: TcpListener,
        api_listener: Option<TcpListener>,
        tls: Option<Arc<TlsReloader>>,
        stop: Trigger,
    ) -> Result<()> {
        let edge = Arc::new(EdgeServer::new(
            self.service.clone(),
            EdgeConfig::new(
                &self.config.http.domain,
                self.config.http.max_conns_per_key,
                self.config.http.use_proxy_protocol,
            ),
        ));
        let edge_task = tokio::spawn(edge.run(edge_listener, stop.clone()));
        let api_task = api_listener.map(|listener| {
            let api = Arc::new(ApiServer::new(self.auth.clone()));
            tokio::spawn(api.run(listener, stop.clone()))
        });

        log::info!("tunnel listening on {}", tunnel_listener.local_addr()?);
        loop {
            tokio::select! {
                _ = stop.async_wait() => {
                    log::info!("shutdown signal received, stopping listeners");
                    break;
                }
                accepted = tunnel_listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let _ = socket.set_nodelay(true);
                            let service = self.service.clone();
                            let stop = stop.clone();
                            let tls = tls.clone();
                            tokio::spawn(async move {
                                let stream: Box<dyn TunnelStream> = match &tls {
                                    Some(reloader) => {
                                        match reloader.acceptor().accept(socket).await {
                                            Ok(stream) => Box::new(stream),
                                            Err(e) => {
                                                log::warn!("tls handshake with {} failed: {:#}", peer, e);
                                                return;
                                            }
                                        }
                                    }
                                    None => Box::new(socket),
                                };
                                if let Err(e) = service.handle_reverse_conn(stream, peer, stop).await {
                                    log::info!("tunnel connection from {} ended: {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("failed to accept tunnel connection: {:?}", e);
                        }
                    }
                }
            }
        }

        self.registry.close();
        let _ = edge_task.await;
        if let Some(api_task) = api_task {
            let _ = api_task.await;
        }
        Ok(())
    }
}
