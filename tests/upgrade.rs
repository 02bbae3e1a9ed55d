//! Websockets through the proxy: HTTP/1.1 protocol switch and HTTP/2
//! extended CONNECT.

mod common;

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Empty;
use hyper::ext::Protocol;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use common::*;

#[tokio::test]
async fn websocket_messages_flow_both_ways() {
    let (backend, backend_closed) = start_websocket_echo_backend().await;
    let proxy = start_proxy(settings(format!("http://{}", backend))).await;

    let (mut ws, response) = tokio_tungstenite::connect_async(format!("ws://{}/chat", proxy.addr))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 101);

    for text in ["hello", "second message", ""] {
        ws.send(Message::text(text)).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed.into_text().unwrap().as_str(), text);
    }

    let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    ws.send(Message::binary(payload.clone())).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(echoed.into_data().as_ref(), payload.as_slice());

    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::timeout(Duration::from_secs(5), backend_closed)
        .await
        .expect("backend sees the close within the interval")
        .unwrap();
}

#[tokio::test]
async fn websocket_to_missing_backend_fails_handshake() {
    let backend = closed_port().await;
    let proxy = start_proxy(settings(format!("http://{}", backend))).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/chat", proxy.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 502)
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn websocket_over_extended_connect() {
    let (backend, backend_closed) = start_websocket_echo_backend().await;
    let proxy = start_proxy(settings(format!("http://{}", backend))).await;

    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(connection);

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(format!("http://{}/chat", proxy.addr))
        .header("sec-websocket-version", "13")
        .body(Empty::<Bytes>::new())
        .unwrap();
    request
        .extensions_mut()
        .insert(Protocol::from_static("websocket"));

    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("sec-websocket-accept"));

    let upgraded = hyper::upgrade::on(response).await.unwrap();
    let mut ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;

    for text in ["ping-h2", "second over h2"] {
        ws.send(Message::text(text)).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed.into_text().unwrap().as_str(), text);
    }

    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::timeout(Duration::from_secs(5), backend_closed)
        .await
        .expect("backend sees the close within the interval")
        .unwrap();
}
