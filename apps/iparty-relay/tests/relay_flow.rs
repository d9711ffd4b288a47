use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use iparty_relay::{RelayConfig, RelayServer, TunnelRegistry};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use reqwest::header::CONTENT_TYPE;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tunnel_proto::{
    external_ws_path, registration_path, HttpRequestFrame, HttpResponseFrame, TunnelFrame,
    TunnelKind, WsDataFrame, WsDisconnectFrame,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    registry: TunnelRegistry,
}

impl Relay {
    async fn start(request_timeout: Duration) -> Self {
        Self::start_with_metrics(request_timeout, None).await
    }

    async fn start_with_metrics(
        request_timeout: Duration,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let mut config = RelayConfig::with_listen_addr("127.0.0.1:0".parse().unwrap());
        config.request_timeout = request_timeout;
        let server = RelayServer::bind(&config, metrics).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        tokio::spawn(server.serve(std::future::pending()));
        Relay { addr, registry }
    }

    fn http_url(&self, host_id: &str, rest: &str) -> String {
        format!("http://{}/host/{host_id}/http{rest}", self.addr)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    async fn connect_host(&self, host_id: &str, kind: TunnelKind) -> Socket {
        let url = self.ws_url(&registration_path(host_id, kind));
        let (socket, _) = connect_async(url).await.unwrap();
        self.wait_until(|registry| {
            registry
                .get(host_id)
                .is_some_and(|host| host.is_connected(kind))
        })
        .await;
        socket
    }

    async fn connect_client(&self, host_id: &str, expected_clients: usize) -> Socket {
        let (socket, _) = connect_async(self.ws_url(&external_ws_path(host_id)))
            .await
            .unwrap();
        self.wait_until(|registry| {
            registry
                .get(host_id)
                .is_some_and(|host| host.client_count() == expected_clients)
        })
        .await;
        socket
    }

    async fn wait_until(&self, check: impl Fn(&TunnelRegistry) -> bool) {
        for _ in 0..500 {
            if check(&self.registry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("relay never reached the expected state");
    }
}

async fn next_frame(socket: &mut Socket) -> TunnelFrame {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return TunnelFrame::decode(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("unexpected tunnel message {other:?}"),
        }
    }
}

async fn next_http_request(socket: &mut Socket) -> HttpRequestFrame {
    match next_frame(socket).await {
        TunnelFrame::HttpRequest(frame) => frame,
        other => panic!("expected http request, got {other:?}"),
    }
}

async fn send_frame(socket: &mut Socket, frame: impl Into<TunnelFrame>) {
    let text = frame.into().encode();
    socket.send(Message::Text(text.into())).await.unwrap();
}

async fn expect_close(socket: &mut Socket) -> (u16, String) {
    loop {
        match socket.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.as_str().to_string())
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let waited = timeout(Duration::from_millis(200), socket.next()).await;
    assert!(waited.is_err(), "socket received {waited:?}");
}

fn handshake_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected http handshake failure, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn http_request_round_trips_through_host() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let url = relay.http_url("abc", "/api/join?room=7");
    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(r#"{"name":"p1"}"#)
            .send()
            .await
    });

    let frame = next_http_request(&mut host).await;
    assert_eq!(frame.method, "POST");
    // Only the path is forwarded; the query stays behind.
    assert_eq!(frame.url, "/api/join");
    assert_eq!(frame.content_type, "application/json");
    assert_eq!(frame.body().unwrap(), br#"{"name":"p1"}"#);

    send_frame(
        &mut host,
        HttpResponseFrame::new(frame.request_id, 201, b"created").with_content_type("text/plain"),
    )
    .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    assert_eq!(response.text().await.unwrap(), "created");
    assert_eq!(relay.registry.get("abc").unwrap().pending_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn bare_http_prefix_maps_to_root() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let url = relay.http_url("abc", "");
    let request = tokio::spawn(async move { reqwest::get(url).await });

    let frame = next_http_request(&mut host).await;
    assert_eq!(frame.method, "GET");
    assert_eq!(frame.url, "/");
    assert_eq!(frame.body_base64, "");
    send_frame(&mut host, HttpResponseFrame::new(frame.request_id, 204, b"")).await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 204);
}

#[test_timeout::tokio_timeout_test]
async fn request_without_tunnel_gets_502() {
    let relay = Relay::start(Duration::from_secs(10)).await;

    let response = reqwest::get(relay.http_url("nobody", "/x")).await.unwrap();
    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(
        response.text().await.unwrap(),
        "Unity HTTP tunnel not connected"
    );
}

#[test_timeout::tokio_timeout_test]
async fn silent_host_times_out_and_late_reply_is_ignored() {
    let relay = Relay::start(Duration::from_millis(300)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let url = relay.http_url("abc", "/slow");
    let request = tokio::spawn(async move { reqwest::get(url).await });
    let frame = next_http_request(&mut host).await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 504);
    assert_eq!(response.text().await.unwrap(), "Timeout waiting for Unity");
    assert_eq!(relay.registry.get("abc").unwrap().pending_count(), 0);

    // The late answer is dropped and the tunnel keeps working.
    send_frame(&mut host, HttpResponseFrame::new(frame.request_id, 200, b"late")).await;
    let url = relay.http_url("abc", "/fast");
    let request = tokio::spawn(async move { reqwest::get(url).await });
    let frame = next_http_request(&mut host).await;
    assert_eq!(frame.url, "/fast");
    send_frame(&mut host, HttpResponseFrame::new(frame.request_id, 200, b"ok")).await;
    let response = request.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[test_timeout::tokio_timeout_test]
async fn closing_http_tunnel_fails_pending_requests() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let url = relay.http_url("abc", "/hang");
    let request = tokio::spawn(async move { reqwest::get(url).await });
    next_http_request(&mut host).await;

    host.close(None).await.unwrap();
    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(response.text().await.unwrap(), "Unity HTTP tunnel closed");

    let entry = relay.registry.get("abc").unwrap();
    assert!(!entry.is_connected(TunnelKind::Http));
    assert_eq!(entry.pending_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn concurrent_requests_resolve_by_request_id() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let first = tokio::spawn(reqwest::get(relay.http_url("abc", "/one")));
    let first_frame = next_http_request(&mut host).await;
    let second = tokio::spawn(reqwest::get(relay.http_url("abc", "/two")));
    let second_frame = next_http_request(&mut host).await;
    assert_ne!(first_frame.request_id, second_frame.request_id);

    // Answer out of order.
    send_frame(&mut host, HttpResponseFrame::new(second_frame.request_id, 200, b"two")).await;
    send_frame(&mut host, HttpResponseFrame::new(first_frame.request_id, 200, b"one")).await;

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.text().await.unwrap(), "one");
    assert_eq!(second.text().await.unwrap(), "two");
}

#[test_timeout::tokio_timeout_test]
async fn ws_clients_are_multiplexed_over_one_tunnel() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Ws).await;
    let mut alice = relay.connect_client("abc", 1).await;
    let mut bob = relay.connect_client("abc", 2).await;

    alice.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    let alice_id = match next_frame(&mut host).await {
        TunnelFrame::WsData(frame) => {
            assert_eq!(frame.payload().unwrap(), vec![1, 2, 3]);
            frame.client_id
        }
        other => panic!("expected ws data, got {other:?}"),
    };

    bob.send(Message::Text("hi".into())).await.unwrap();
    let bob_id = match next_frame(&mut host).await {
        TunnelFrame::WsData(frame) => {
            assert_eq!(frame.payload().unwrap(), b"hi");
            frame.client_id
        }
        other => panic!("expected ws data, got {other:?}"),
    };
    assert_ne!(alice_id, bob_id);

    send_frame(&mut host, WsDataFrame::new(alice_id.clone(), &[4, 5, 6])).await;
    match alice.next().await {
        Some(Ok(Message::Binary(bytes))) => assert_eq!(bytes.as_ref(), &[4, 5, 6]),
        other => panic!("expected binary frame, got {other:?}"),
    }
    assert_silent(&mut bob).await;

    // Frames for an id that never existed go nowhere.
    send_frame(&mut host, WsDataFrame::new("ghost", b"boo")).await;
    assert_silent(&mut alice).await;

    alice.close(None).await.unwrap();
    match next_frame(&mut host).await {
        TunnelFrame::WsDisconnect(frame) => assert_eq!(frame.client_id, alice_id),
        other => panic!("expected disconnect, got {other:?}"),
    }
    relay
        .wait_until(|registry| registry.get("abc").unwrap().client_count() == 1)
        .await;
}

#[test_timeout::tokio_timeout_test]
async fn host_can_disconnect_a_client() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Ws).await;
    let mut client = relay.connect_client("abc", 1).await;

    client.send(Message::Text("hello".into())).await.unwrap();
    let client_id = match next_frame(&mut host).await {
        TunnelFrame::WsData(frame) => frame.client_id,
        other => panic!("expected ws data, got {other:?}"),
    };

    send_frame(&mut host, WsDisconnectFrame::new(client_id)).await;
    let (code, reason) = expect_close(&mut client).await;
    assert_eq!(code, u16::from(CloseCode::Normal));
    assert_eq!(reason, "Closed by host");
    relay
        .wait_until(|registry| registry.get("abc").unwrap().client_count() == 0)
        .await;
    assert_silent(&mut host).await;
}

#[test_timeout::tokio_timeout_test]
async fn closing_ws_tunnel_closes_every_client() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Ws).await;
    let mut first = relay.connect_client("abc", 1).await;
    let mut second = relay.connect_client("abc", 2).await;

    host.close(None).await.unwrap();
    for client in [&mut first, &mut second] {
        let (code, reason) = expect_close(client).await;
        assert_eq!(code, 1011);
        assert_eq!(reason, "Tunnel closed");
    }

    let entry = relay.registry.get("abc").unwrap();
    assert!(!entry.is_connected(TunnelKind::Ws));
    assert_eq!(entry.client_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn ws_upgrade_without_tunnel_is_refused() {
    let relay = Relay::start(Duration::from_secs(10)).await;

    let err = connect_async(relay.ws_url(&external_ws_path("abc")))
        .await
        .unwrap_err();
    assert_eq!(handshake_status(err), 503);

    // An HTTP tunnel alone does not open the WS side.
    let _http = relay.connect_host("abc", TunnelKind::Http).await;
    let err = connect_async(relay.ws_url(&external_ws_path("abc")))
        .await
        .unwrap_err();
    assert_eq!(handshake_status(err), 503);
}

#[test_timeout::tokio_timeout_test]
async fn upgrade_on_unknown_path_is_refused() {
    let relay = Relay::start(Duration::from_secs(10)).await;

    for path in ["/unity/abc/ftp", "/unity/abc", "/host/abc/http", "/lobby"] {
        let err = connect_async(relay.ws_url(path)).await.unwrap_err();
        assert_eq!(handshake_status(err), 404, "{path}");
    }
    assert!(relay.registry.is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn reconnecting_host_replaces_old_tunnel() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut old = relay.connect_host("abc", TunnelKind::Http).await;
    let old_id = relay
        .registry
        .get("abc")
        .unwrap()
        .live_tunnel(TunnelKind::Http)
        .unwrap()
        .id();

    let (mut new, _) = connect_async(relay.ws_url(&registration_path("abc", TunnelKind::Http)))
        .await
        .unwrap();
    relay
        .wait_until(|registry| {
            registry
                .get("abc")
                .and_then(|host| host.live_tunnel(TunnelKind::Http))
                .is_some_and(|tunnel| tunnel.id() != old_id)
        })
        .await;

    let (code, reason) = expect_close(&mut old).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "Replaced by new tunnel");
    drop(old);

    // The old socket's teardown must not disturb the new tunnel.
    let url = relay.http_url("abc", "/after");
    let request = tokio::spawn(async move { reqwest::get(url).await });
    let frame = next_http_request(&mut new).await;
    send_frame(&mut new, HttpResponseFrame::new(frame.request_id, 200, b"new")).await;
    let response = request.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "new");
    assert!(relay.registry.get("abc").unwrap().is_connected(TunnelKind::Http));
}

#[test_timeout::tokio_timeout_test]
async fn malformed_host_frames_are_dropped() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let mut host = relay.connect_host("abc", TunnelKind::Http).await;

    let url = relay.http_url("abc", "/x");
    let request = tokio::spawn(async move { reqwest::get(url).await });
    let frame = next_http_request(&mut host).await;

    host.send(Message::Text("not json".into())).await.unwrap();
    host.send(Message::Text(r#"{"requestId":"x"}"#.into()))
        .await
        .unwrap();
    send_frame(&mut host, HttpResponseFrame::new(frame.request_id, 200, b"fine")).await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "fine");
    assert!(relay.registry.get("abc").unwrap().is_connected(TunnelKind::Http));
}

#[test_timeout::tokio_timeout_test]
async fn echo_host_serves_both_tunnels() {
    let relay = Relay::start(Duration::from_secs(10)).await;
    let base = format!("ws://{}", relay.addr);
    tokio::spawn(iparty_relay::cli::run_echo_host(base, "echo".into()));
    relay
        .wait_until(|registry| {
            registry.get("echo").is_some_and(|host| {
                host.is_connected(TunnelKind::Http) && host.is_connected(TunnelKind::Ws)
            })
        })
        .await;

    let response = reqwest::get(relay.http_url("echo", "/og%20page.html?hostId=echo"))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["url"], "/og page.html");

    let mut client = relay.connect_client("echo", 1).await;
    client.send(Message::Text("marco".into())).await.unwrap();
    match client.next().await {
        Some(Ok(Message::Binary(bytes))) => assert_eq!(bytes.as_ref(), b"marco"),
        other => panic!("expected echoed frame, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn metrics_are_not_labelled_per_host() {
    // Only this test installs a recorder in this binary.
    let handle = PrometheusBuilder::new().install_recorder().unwrap();
    let relay = Relay::start_with_metrics(Duration::from_secs(10), Some(handle)).await;

    let _first = relay.connect_host("first", TunnelKind::Ws).await;
    let _second = relay.connect_host("second", TunnelKind::Ws).await;
    let _client = relay.connect_client("first", 1).await;

    // Gauges move just after the registry does, so poll the scrape.
    let url = format!("http://{}/metrics", relay.addr);
    let body = loop {
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        if body.contains("iparty_relay_tunnels_active")
            && body.contains("iparty_relay_external_clients")
        {
            break body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(!body.contains("host_id"), "{body}");
    assert!(body.contains(r#"kind="ws""#), "{body}");
}
