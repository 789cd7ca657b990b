//! Integration tests for HttpClient against loopback origin servers

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::Deserialize;

use http_client_r::{
    ClientError, ClientOptions, ConnectErrorKind, Entity, HttpClient, Method, RequestBuilder,
    TrustContext,
};

/// A request as seen by the origin.
struct Captured {
    head: String,
    body: Vec<u8>,
}

/// Accept one connection, capture the request and answer with `reply`.
fn origin(reply: Vec<u8>) -> (u16, thread::JoinHandle<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
            head.push_str(&line);
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        reader.get_mut().write_all(&reply).unwrap();
        Captured { head, body }
    });
    (port, handle)
}

fn reply(head: &str, body: &[u8]) -> Vec<u8> {
    let mut raw = head.as_bytes().to_vec();
    raw.extend_from_slice(body);
    raw
}

fn client() -> HttpClient {
    HttpClient::new(ClientOptions::default().with_trust(TrustContext::platform_default())).unwrap()
}

#[test]
fn test_post_entity_reaches_origin() {
    let (port, server) = origin(reply("HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n", b""));
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/items", port))
        .unwrap()
        .method(Method::Post)
        .param("dry run", "yes")
        .header("X-Request-Id", "abc")
        .content_type("text/plain")
        .charset("UTF-8")
        .entity("payload")
        .build()
        .unwrap();

    let response = client().execute(&request).unwrap();
    assert_eq!(response.status_code(), 201);
    assert_eq!(response.reason_phrase(), "Created");
    assert!(response.raw_body().is_empty());

    let captured = server.join().unwrap();
    assert!(captured.head.starts_with("POST /items?dry+run=yes HTTP/1.1\r\n"));
    assert!(captured.head.contains("Content-Type: text/plain;charset=UTF-8\r\n"));
    assert!(captured.head.contains("Content-Length: 7\r\n"));
    assert!(captured.head.contains("Accept-Encoding: gzip, deflate\r\n"));
    assert!(captured.head.contains("Connection: close\r\n"));
    assert!(captured.head.contains("X-Request-Id: abc\r\n"));
    assert_eq!(captured.body, b"payload");
}

#[test]
fn test_gzip_json_response() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(br#"{"a":1,"tags":["x","y"]}"#).unwrap();
    let body = encoder.finish().unwrap();
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let (port, server) = origin(reply(&head, &body));

    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/data", port))
        .unwrap()
        .accept("application/json")
        .build()
        .unwrap();
    let response = client().execute(&request).unwrap();

    assert_eq!(response.raw_body(), br#"{"a":1,"tags":["x","y"]}"#);
    assert_eq!(response.entity().as_json().unwrap()["a"], 1);

    #[derive(Deserialize)]
    struct Payload {
        a: u32,
        tags: Vec<String>,
    }
    let payload: Payload = response.json().unwrap();
    assert_eq!(payload.a, 1);
    assert_eq!(payload.tags, vec!["x", "y"]);

    let captured = server.join().unwrap();
    assert!(captured.head.contains("Accept: application/json\r\n"));
}

#[test]
fn test_chunked_deflate_form_response() {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"status=ok&count=3&status=done").unwrap();
    let compressed = encoder.finish().unwrap();

    let (first, second) = compressed.split_at(compressed.len() / 2);
    let mut body = Vec::new();
    for chunk in [first, second] {
        body.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(b"0\r\n\r\n");

    let (port, server) = origin(reply(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: deflate\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n",
        &body,
    ));
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/", port))
        .unwrap()
        .build()
        .unwrap();
    let response = client().execute(&request).unwrap();

    match response.entity() {
        Entity::Form(pairs) => assert_eq!(
            pairs,
            &vec![
                ("status".to_string(), "done".to_string()),
                ("count".to_string(), "3".to_string()),
            ]
        ),
        other => panic!("expected form entity, got {:?}", other),
    }
    server.join().unwrap();
}

#[test]
fn test_body_runs_to_close_without_length() {
    let (port, server) = origin(reply(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=ISO-8859-1\r\n\r\n",
        b"caf\xe9",
    ));
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/", port))
        .unwrap()
        .build()
        .unwrap();
    let response = client().execute(&request).unwrap();

    assert_eq!(response.text(), "café");
    assert_eq!(response.entity().as_bytes(), Some(&b"caf\xe9"[..]));
    server.join().unwrap();
}

#[test]
fn test_head_response_has_no_body() {
    let (port, server) = origin(reply(
        "HTTP/1.1 200 OK\r\nContent-Length: 1024\r\n\r\n",
        b"",
    ));
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/", port))
        .unwrap()
        .method(Method::Head)
        .build()
        .unwrap();
    let response = client().execute(&request).unwrap();

    assert_eq!(response.header("content-length"), Some("1024"));
    assert!(response.raw_body().is_empty());
    assert!(server.join().unwrap().head.starts_with("HEAD / HTTP/1.1\r\n"));
}

#[test]
fn test_truncated_body_is_parse_error() {
    let (port, server) = origin(reply(
        "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
        b"short",
    ));
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/", port))
        .unwrap()
        .build()
        .unwrap();
    let result = client().execute(&request);
    assert!(matches!(result, Err(ClientError::ProtocolParse(_))));
    server.join().unwrap();
}

#[test]
fn test_read_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(1500));
        drop(stream);
    });

    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/slow", port))
        .unwrap()
        .read_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let result = client().execute(&request);
    match result {
        Err(e @ ClientError::Timeout(_)) => assert!(e.is_timeout()),
        other => panic!("expected timeout, got {:?}", other.map(|r| r.status_code())),
    }
    server.join().unwrap();
}

#[test]
fn test_connection_refused() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/", port))
        .unwrap()
        .build()
        .unwrap();

    match client().execute(&request) {
        Err(e @ ClientError::Connect { .. }) => {
            assert!(matches!(
                e,
                ClientError::Connect {
                    kind: ConnectErrorKind::Socket,
                    ..
                }
            ));
            assert!(e.raw_os_error().is_some());
        }
        other => panic!("expected connect error, got {:?}", other.map(|r| r.status_code())),
    }
}

#[test]
fn test_dispatch_writes_and_returns() {
    let (port, server) = origin(Vec::new());
    let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/events", port))
        .unwrap()
        .method(Method::Post)
        .entity(r#"{"event":"ping"}"#)
        .content_type("application/json")
        .build()
        .unwrap();

    client().dispatch(&request).unwrap();

    let captured = server.join().unwrap();
    assert!(captured.head.starts_with("POST /events HTTP/1.1\r\n"));
    assert_eq!(captured.body, br#"{"event":"ping"}"#);
}

#[test]
fn test_shared_client_across_threads() {
    let client = client();
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let body = format!("worker {}", i);
                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
                let (port, server) = origin(reply(&head, body.as_bytes()));
                let request = RequestBuilder::new(&format!("http://127.0.0.1:{}/{}", port, i))
                    .unwrap()
                    .build()
                    .unwrap();
                let response = client.execute(&request).unwrap();
                server.join().unwrap();
                (i, response.text())
            })
        })
        .collect();

    for worker in workers {
        let (i, text) = worker.join().unwrap();
        assert_eq!(text, format!("worker {}", i));
    }
}
