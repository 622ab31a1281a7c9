// End to end scenarios: broker, agents and origins wired together in one
// process over real sockets.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use shared::protocol::{self, Command, handshake};
use testing::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_proxies_through_tunnel() {
    let broker = start_broker("test.local", 4).await;
    let origin = start_origin("hello", Duration::ZERO).await;
    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _agent = broker.start_agent(&token, &origin.to_string());
    broker.wait_registered("acme").await;

    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let response = http_request(broker.edge_addr, &get_request(&host, "curl/7", "")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("hello"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_key_is_404() {
    let broker = start_broker("test.local", 4).await;
    let host = format!("ghost.test.local:{}", broker.edge_addr.port());
    let response = http_request(broker.edge_addr, &get_request(&host, "stub-client/1", "")).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"), "got: {}", response);
    assert!(response.contains("404 Not Found"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_dying_mid_request_is_502() {
    let broker = start_broker("test.local", 4).await;
    let token = broker.issue("acme", Duration::from_secs(60)).await;

    // A hand-driven agent that registers, then dies on the first CONNECT
    // instead of binding a data connection
    let tunnel_addr = broker.tunnel_addr;
    let secret = token.secret.clone();
    tokio::spawn(async move {
        let mut ctrl = TcpStream::connect(tunnel_addr).await.unwrap();
        handshake::open_control(&mut ctrl, "acme", &secret).await.unwrap();
        loop {
            match protocol::read_command(&mut ctrl).await {
                Ok(Command::Ping) => {
                    protocol::write_command(&mut ctrl, Command::Pong).await.unwrap();
                }
                Ok(Command::Event) => {
                    let _: protocol::EventFrame = protocol::read_payload(&mut ctrl).await.unwrap();
                }
                Ok(Command::Connect) => {
                    let _ = protocol::read_request_id(&mut ctrl).await;
                    break; // drop the socket, never BIND
                }
                _ => break,
            }
        }
    });
    broker.wait_registered("acme").await;

    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let response = http_request(broker.edge_addr, &get_request(&host, "curl/7", "")).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "got: {}", response);
    assert!(response.contains("502 Bad Gateway"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_limiter_rejects_overflow_request() {
    let broker = start_broker("test.local", 1).await;
    let origin = start_origin("slow", Duration::from_millis(500)).await;
    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _agent = broker.start_agent(&token, &origin.to_string());
    broker.wait_registered("acme").await;

    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let request = get_request(&host, "curl/7", "");
    let (first, second) = tokio::join!(
        http_request(broker.edge_addr, &request),
        http_request(broker.edge_addr, &request),
    );

    let mut statuses = [
        first.split(' ').nth(1).unwrap_or("").to_string(),
        second.split(' ').nth(1).unwrap_or("").to_string(),
    ];
    statuses.sort();
    assert_eq!(statuses, ["200", "429"], "got: {:?}", statuses);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_token_goes_dark() {
    let broker = start_broker("test.local", 4).await;
    let token = broker.issue("x", Duration::from_secs(1)).await;
    assert!(broker.broker.auth.verify("x", &token.secret).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(!broker.broker.auth.verify("x", &token.secret).await.unwrap());

    let host = format!("x.test.local:{}", broker.edge_addr.port());
    let response = http_request(broker.edge_addr, &get_request(&host, "curl/7", "")).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"), "got: {}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_consent_flow_end_to_end() {
    let broker = start_broker("test.local", 4).await;
    let origin = start_origin("hello", Duration::ZERO).await;
    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _agent = broker.start_agent(&token, &origin.to_string());
    broker.wait_registered("acme").await;
    let host = format!("acme.test.local:{}", broker.edge_addr.port());

    // A browser without the consent cookie lands on the interstitial
    let form = http_request(broker.edge_addr, &get_request(&host, "Mozilla/5.0", "")).await;
    assert!(form.starts_with("HTTP/1.1 200 OK"), "got: {}", form);
    assert!(form.contains("Consent Required"));
    let csrf = set_cookie_value(&form, "csrf_token").expect("a csrf cookie must be set");

    // Submitting the form with the matching token approves and redirects
    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("consent", "true")
        .append_pair("csrf_token", &csrf)
        .append_pair("original_url", "/")
        .finish();
    let post = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nUser-Agent: Mozilla/5.0\r\nCookie: csrf_token={}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        host,
        csrf,
        body.len(),
        body
    );
    let redirect = http_request(broker.edge_addr, &post).await;
    assert!(redirect.starts_with("HTTP/1.1 303 See Other"), "got: {}", redirect);
    assert!(redirect.contains("Location: /\r\n"));
    assert_eq!(set_cookie_value(&redirect, "consent").as_deref(), Some("approved"));

    // With the consent cookie the browser reaches the origin
    let proxied = http_request(
        broker.edge_addr,
        &get_request(&host, "Mozilla/5.0", "Cookie: consent=approved\r\n"),
    )
    .await;
    assert!(proxied.starts_with("HTTP/1.1 200 OK"), "got: {}", proxied);
    assert!(proxied.ends_with("hello"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mismatched_csrf_is_rejected() {
    let broker = start_broker("test.local", 4).await;
    let host = format!("acme.test.local:{}", broker.edge_addr.port());

    let body = "consent=true&csrf_token=forged&original_url=%2F";
    let post = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nUser-Agent: Mozilla/5.0\r\nCookie: csrf_token=real\r\nContent-Length: {}\r\n\r\n{}",
        host,
        body.len(),
        body
    );
    let response = http_request(broker.edge_addr, &post).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", response);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_round_robin_across_two_agents() {
    let broker = start_broker("test.local", 8).await;
    let origin = start_origin("hello", Duration::ZERO).await;
    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _first = broker.start_agent(&token, &origin.to_string());
    let _second = broker.start_agent(&token, &origin.to_string());
    for _ in 0..100 {
        if broker.broker.registry.live_connections("acme") == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(broker.broker.registry.live_connections("acme"), 2);

    // Both pool members serve requests
    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    for _ in 0..4 {
        let response = http_request(broker.edge_addr, &get_request(&host, "curl/7", "")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_management_api_token_lifecycle() {
    let broker = start_broker("test.local", 4).await;
    let origin = start_origin("hello", Duration::ZERO).await;

    // Health probe
    let health = http_request(broker.api_addr, "GET /health HTTP/1.1\r\nHost: api\r\n\r\n").await;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert!(health.contains(r#"{"status":"healthy"}"#));

    // Issue a token over the API and run a real agent with it
    let body = r#"{"key_id": "acme", "ttl": 60}"#;
    let request = format!(
        "POST /token HTTP/1.1\r\nHost: api\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let created = http_request(broker.api_addr, &request).await;
    assert!(created.starts_with("HTTP/1.1 200 OK"), "got: {}", created);
    let json: serde_json::Value =
        serde_json::from_str(created.split("\r\n\r\n").nth(1).unwrap()).unwrap();
    assert_eq!(json["key_id"], "acme");
    let token = shared::token::Token::decode(json["token"].as_str().unwrap()).unwrap();

    let _agent = broker.start_agent(&token, &origin.to_string());
    broker.wait_registered("acme").await;
    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let response = http_request(broker.edge_addr, &get_request(&host, "curl/7", "")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);

    // Revoke; new tunnel registrations are rejected from here on
    let deleted =
        http_request(broker.api_addr, "DELETE /token/acme HTTP/1.1\r\nHost: api\r\n\r\n").await;
    assert!(deleted.starts_with("HTTP/1.1 204 No Content"));
    assert!(!broker.broker.auth.is_key_exists("acme").await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_protocol_preamble_on_the_edge() {
    let broker = start_broker_with("test.local", 4, |config| {
        config.http.use_proxy_protocol = true;
    })
    .await;

    // An origin that reports the forwarded client address it was handed
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = origin.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let forwarded = head
                    .lines()
                    .find_map(|line| line.strip_prefix("X-Forwarded-For: "))
                    .unwrap_or("none")
                    .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    forwarded.len(),
                    forwarded
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _agent = broker.start_agent(&token, &origin_addr);
    broker.wait_registered("acme").await;

    // Speak PROXY v1 ahead of the request, the way a load balancer would
    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let request = format!(
        "PROXY TCP4 198.51.100.7 127.0.0.1 4711 80\r\nGET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/7\r\nX-Forwarded-For: 198.51.100.7\r\n\r\n",
        host
    );
    let response = http_request(broker.edge_addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("198.51.100.7"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preamble_reaches_origin_intact() {
    let broker = start_broker("test.local", 4).await;

    // An origin that echoes the request line back, to prove the buffered
    // head was replayed unchanged
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = origin.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                let first_line = String::from_utf8_lossy(&buf[..n])
                    .lines()
                    .next()
                    .unwrap_or("")
                    .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    first_line.len(),
                    first_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    let token = broker.issue("acme", Duration::from_secs(60)).await;
    let _agent = broker.start_agent(&token, &origin_addr);
    broker.wait_registered("acme").await;

    let host = format!("acme.test.local:{}", broker.edge_addr.port());
    let request = format!(
        "GET /some/deep/path?q=1 HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/7\r\n\r\n",
        host
    );
    let response = http_request(broker.edge_addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("GET /some/deep/path?q=1 HTTP/1.1"));
}
