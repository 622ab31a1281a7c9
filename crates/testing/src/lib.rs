// In-process harness for the end to end scenarios: a broker on ephemeral
// ports, real agents and a stub origin, all inside one runtime.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pubtunnel_client::{
    config::{BrokerConfig, ClientConfig},
    tunnel::TunnelAgent,
};
use pubtunnel_server::{Broker, auth::MemoryStorage, config::ServerConfig};
use shared::{
    system::trigger::Trigger,
    token::{Token, TokenType},
};

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub edge_addr: SocketAddr,
    pub tunnel_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub stop: Trigger,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.stop.set();
    }
}

pub async fn start_broker(domain: &str, max_conns_per_key: usize) -> TestBroker {
    start_broker_with(domain, max_conns_per_key, |_| {}).await
}

pub async fn start_broker_with(
    domain: &str,
    max_conns_per_key: usize,
    adjust: impl FnOnce(&mut ServerConfig),
) -> TestBroker {
    let edge = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let edge_addr = edge.local_addr().unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let api_addr = api.local_addr().unwrap();

    let mut config = ServerConfig::default();
    config.http.domain = domain.to_string();
    config.http.max_conns_per_key = max_conns_per_key;
    config.http.public_port = Some(edge_addr.port());
    adjust(&mut config);

    let broker = Arc::new(Broker::new(Arc::new(MemoryStorage::new()), config));
    let stop = Trigger::new();
    {
        let broker = broker.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            broker.serve(edge, tunnel, Some(api), None, stop).await.unwrap();
        });
    }

    TestBroker {
        broker,
        edge_addr,
        tunnel_addr,
        api_addr,
        stop,
    }
}

impl TestBroker {
    pub async fn issue(&self, key_id: &str, ttl: Duration) -> Token {
        self.broker
            .auth
            .issue(TokenType::Web, Some(key_id), ttl)
            .await
            .unwrap()
    }

    /// Run a real agent against this broker; returns its stop trigger.
    pub fn start_agent(&self, token: &Token, origin: &str) -> Trigger {
        let config = ClientConfig {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: self.tunnel_addr.port(),
            },
            token: token.encode(),
            origin: origin.to_string(),
            tls: Default::default(),
            log_level: None,
        };
        let agent = TunnelAgent::new(config).unwrap();
        let stop = Trigger::new();
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                let _ = agent.run(stop).await;
            });
        }
        stop
    }

    pub async fn wait_registered(&self, key_id: &str) {
        for _ in 0..100 {
            if self.broker.registry.live_connections(key_id) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agent for {} never registered", key_id);
    }
}

/// Stub origin answering every connection with a fixed 200 after `delay`.
pub async fn start_origin(body: &'static str, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

/// One raw HTTP/1.1 exchange; returns the whole response as text.
pub async fn http_request(addr: SocketAddr, request: &str) -> String {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), socket.read_to_end(&mut response))
        .await
        .expect("response must arrive")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

pub fn get_request(host: &str, user_agent: &str, extra_headers: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\n{}\r\n",
        host, user_agent, extra_headers
    )
}

/// Value of a cookie set by a response, if any.
pub fn set_cookie_value(response: &str, name: &str) -> Option<String> {
    let marker = format!("Set-Cookie: {}=", name);
    for line in response.lines() {
        if let Some(rest) = line.strip_prefix(&marker) {
            return Some(rest.split(';').next().unwrap_or("").to_string());
        }
    }
    None
}
