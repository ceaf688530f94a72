use exchange_resilience::{ConnectionConfig, ConnectionManager, ConnectionState, WsConnector};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Accepts websocket clients forever. Each client gets one data message in reply to
/// its first control message, then the venue hangs up.
async fn venue(listener: TcpListener, control: mpsc::UnboundedSender<Value>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let control = control.clone();
        tokio::spawn(async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let _ = control.send(request.clone());

                let reply = json!({
                    "channel": request["channel"],
                    "params": request["params"],
                    "data": { "price": "64000.5" }
                });
                let _ = ws.send(Message::text(reply.to_string())).await;
                let _ = ws.close(None).await;
                return;
            }
        });
    }
}

#[tokio::test]
async fn test_websocket_round_trip_and_resubscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (control, mut requests) = mpsc::unbounded_channel();
    tokio::spawn(venue(listener, control));

    let manager = ConnectionManager::builder("loopback", Arc::new(WsConnector::new(url)))
        .config(ConnectionConfig {
            reconnect_delay_ms: 20,
            max_reconnect_delay_ms: 100,
            heartbeat_interval_ms: None,
            ..ConnectionConfig::default()
        })
        .build();

    let params = json!({ "symbol": "BTC-USDT" });
    let mut ticker = manager.subscribe("ticker", params.clone()).unwrap();
    manager.connect().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["op"], "subscribe");
    assert_eq!(first["params"], params);

    let update = tokio::time::timeout(Duration::from_secs(5), ticker.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(update, json!({ "price": "64000.5" }));

    // The venue closed the socket after replying, so the manager dials again and
    // replays the subscription on its own.
    let replayed = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replayed, first);

    let again = tokio::time::timeout(Duration::from_secs(5), ticker.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(again, update);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}
