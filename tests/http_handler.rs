//! HTTP handler clients against an in-process hyper server.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use streamweave_vertex::error::Error;
use streamweave_vertex::message::{Message, Offset, ReadMessage};
use streamweave_vertex::udf::http::{HttpMapClient, HttpMapStreamClient, MapRequest};
use streamweave_vertex::udf::{HealthChecker, MapApplier, MapStreamApplier};
use streamweave_vertex::watermark::Watermark;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper-cases the payload. `/map` answers with one result tagged `upper`
/// (five for payloads starting with "big"); `/mapstream` streams one result
/// per byte.
async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
  let method = req.method().clone();
  let path = req.uri().path().to_string();
  let body = match req.into_body().collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(_) => return Ok(status(StatusCode::BAD_REQUEST)),
  };

  match (method, path.as_str()) {
    (Method::GET, "/ready") => Ok(Response::new(Full::new(Bytes::new()))),
    (Method::POST, "/map") => {
      let request: MapRequest = serde_json::from_slice(&body).unwrap();
      let value = STANDARD.decode(request.value).unwrap().to_ascii_uppercase();
      let copies = if value.starts_with(b"BIG") { 5 } else { 1 };
      let results: Vec<serde_json::Value> = (0..copies)
        .map(|_| serde_json::json!({ "keys": &request.keys, "value": STANDARD.encode(&value), "tags": ["upper"] }))
        .collect();
      let response = serde_json::json!({ "results": results });
      Ok(Response::new(Full::new(Bytes::from(response.to_string()))))
    }
    (Method::POST, "/mapstream") => {
      let request: MapRequest = serde_json::from_slice(&body).unwrap();
      let value = STANDARD.decode(request.value).unwrap();
      let mut lines = String::new();
      for byte in value {
        let line = serde_json::json!({ "value": STANDARD.encode([byte]) });
        lines.push_str(&line.to_string());
        lines.push('\n');
      }
      Ok(Response::new(Full::new(Bytes::from(lines))))
    }
    _ => Ok(status(StatusCode::NOT_FOUND)),
  }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
  let mut response = Response::new(Full::new(Bytes::new()));
  *response.status_mut() = code;
  response
}

async fn serve() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        return;
      };
      tokio::spawn(async move {
        let _ = http1::Builder::new()
          .serve_connection(TokioIo::new(stream), service_fn(handle))
          .await;
      });
    }
  });
  addr
}

fn read_message(value: &str) -> ReadMessage {
  ReadMessage {
    message: Message::new(value.to_string()).with_keys(vec!["k".into()]),
    read_offset: Offset::new(5, 0),
    watermark: Watermark(10),
  }
}

#[tokio::test]
async fn test_map_round_trip() {
  let addr = serve().await;
  let client = HttpMapClient::new(&addr.to_string(), 1024 * 1024);
  client
    .wait_until_ready(&CancellationToken::new())
    .await
    .unwrap();

  let results = client.apply_map(&read_message("hello")).await.unwrap();
  assert_eq!(results.len(), 1);
  assert_eq!(results[0].value, "HELLO");
  assert_eq!(results[0].keys, vec!["k".to_string()]);
  assert_eq!(results[0].tags, vec!["upper".to_string()]);
  assert_eq!(results[0].id, "5-0-0");
}

#[tokio::test]
async fn test_map_stream_round_trip() {
  let addr = serve().await;
  let client = HttpMapStreamClient::new(&addr.to_string(), 1024 * 1024);
  client.is_healthy().await.unwrap();

  let (tx, mut rx) = mpsc::channel(16);
  client
    .apply_map_stream(&read_message("abc"), tx)
    .await
    .unwrap();
  let mut values = Vec::new();
  while let Some(message) = rx.recv().await {
    values.push(message.value);
  }
  assert_eq!(values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_response_over_limit_is_rejected() {
  let addr = serve().await;
  let client = HttpMapClient::new(&addr.to_string(), 400);
  let big = format!("big{}", "x".repeat(100));
  let err = client.apply_map(&read_message(&big)).await.unwrap_err();
  assert!(matches!(err, Error::Udf(_)), "{:?}", err);
}

#[tokio::test]
async fn test_unreachable_handler_never_becomes_ready() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let client = HttpMapClient::new(&addr.to_string(), 1024);
  assert!(client.is_healthy().await.is_err());

  let cancel = CancellationToken::new();
  let stopper = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    stopper.cancel();
  });
  let err = client.wait_until_ready(&cancel).await.unwrap_err();
  assert!(matches!(err, Error::Cancelled));
}
