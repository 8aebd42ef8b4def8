use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full, StreamBody};
use indoc::indoc;
use portico_http::connection::HttpConnection;
use portico_http::handler::{BoxError, ErrorHook, Handler, make_handler, status_response};
use portico_http::protocol::ParseError;
use portico_http::protocol::body::ReqBody;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn crlf(raw: &str) -> String {
    raw.replace('\n', "\r\n")
}

fn serve<H>(handler: H) -> DuplexStream
where
    H: Handler + 'static,
    <H::RespBody as Body>::Error: Into<BoxError> + Send,
    <H::RespBody as Body>::Data: Send,
{
    serve_with_hook(handler, None)
}

fn serve_with_hook<H>(handler: H, error_hook: Option<Arc<dyn ErrorHook>>) -> DuplexStream
where
    H: Handler + 'static,
    <H::RespBody as Body>::Error: Into<BoxError> + Send,
    <H::RespBody as Body>::Data: Send,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server);
        let connection = HttpConnection::new(reader, writer);
        let _ = match error_hook {
            Some(error_hook) => connection.process_with_hook(Arc::new(handler), error_hook).await,
            None => connection.process(Arc::new(handler)).await,
        };
    });
    client
}

async fn read_all(client: &mut DuplexStream) -> String {
    let mut buf = Vec::new();
    timeout(WAIT, client.read_to_end(&mut buf)).await.expect("server kept the connection open").unwrap();
    String::from_utf8(buf).unwrap()
}

/// Sends `raw`, closes the write side and reads until the server closes.
async fn exchange(client: &mut DuplexStream, raw: &str) -> String {
    client.write_all(raw.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();
    read_all(client).await
}

async fn read_until(client: &mut DuplexStream, marker: &str) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(marker.as_bytes()) {
        let n = timeout(WAIT, client.read(&mut byte)).await.expect("marker never arrived").unwrap();
        assert_eq!(n, 1, "connection closed before {marker:?}");
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

fn text(body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::new(Full::new(body.into()))
}

async fn echo(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
    let body = request.into_body().collect().await?.to_bytes();
    Ok(text(body))
}

async fn hello(_request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
    Ok(text("hello"))
}

#[tokio::test]
async fn content_length_with_transfer_encoding_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut client = serve(make_handler(move |_request: Request<ReqBody>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(text("unreachable")) }
    }));

    let raw = crlf(indoc! {"
        POST / HTTP/1.1
        Host: a.example
        Content-Length: 5
        Transfer-Encoding: chunked

        0

    "});
    let response = exchange(&mut client, &raw).await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("connection: close\r\n"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_request_line_is_rejected() {
    let mut client = serve(make_handler(hello));
    let response = exchange(&mut client, "GET /a b HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
}

#[tokio::test]
async fn close_before_headers_complete_is_silent() {
    let mut client = serve(make_handler(hello));
    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a.exa").await;
    assert!(response.is_empty());
}

#[tokio::test]
async fn multibyte_body_gets_byte_length() {
    let mut client = serve(make_handler(|_request: Request<ReqBody>| async {
        Ok::<_, BoxError>(text("韓國".repeat(10)))
    }));

    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("content-length: 60\r\n"), "{response}");
    assert!(response.ends_with(&"韓國".repeat(10)));
}

#[tokio::test]
async fn head_sends_headers_only() {
    let mut client = serve(make_handler(|_request: Request<ReqBody>| async {
        Ok::<_, BoxError>(text(vec![b'x'; 300]))
    }));

    let raw = "HEAD / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    let (head_response, rest) = response.split_once("\r\n\r\n").unwrap();
    assert!(head_response.contains("content-length: 300"));
    assert!(rest.starts_with("HTTP/1.1 200 OK\r\n"), "HEAD response carried body bytes: {rest}");
    assert!(rest.ends_with(&"x".repeat(300)));
}

#[tokio::test]
async fn no_content_and_not_modified_never_carry_a_body() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        let status = if request.uri().path() == "/204" { StatusCode::NO_CONTENT } else { StatusCode::NOT_MODIFIED };
        let mut response = text("ignored");
        *response.status_mut() = status;
        response.headers_mut().insert("content-length", "7".parse().unwrap());
        Ok::<_, BoxError>(response)
    }));

    let raw = "GET /204 HTTP/1.1\r\nHost: a\r\n\r\nGET /304 HTTP/1.1\r\nHost: a\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    assert_eq!(response, "HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 304 Not Modified\r\n\r\n");
}

#[tokio::test]
async fn chunked_request_trailers_reach_the_handler() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        let (mut parts, body) = request.into_parts();
        let bytes = body.collect_into(&mut parts.headers).await?;
        let sum = parts.headers.get("x-sum").map(|value| value.to_str().unwrap_or_default().to_string()).unwrap_or_default();
        Ok::<_, BoxError>(text(format!("{}|{sum}", String::from_utf8_lossy(&bytes))))
    }));

    let raw = crlf(indoc! {"
        POST /upload HTTP/1.1
        Host: a.example
        Transfer-Encoding: chunked
        Trailer: x-sum

        5
        hello
        6
         world
        0
        X-Sum: 11

    "});
    let response = exchange(&mut client, &raw).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("hello world|11"), "{response}");
}

#[tokio::test]
async fn missing_declared_trailer_fails_the_body_read() {
    let mut client = serve(make_handler(echo));

    let raw = crlf(indoc! {"
        POST / HTTP/1.1
        Host: a.example
        Transfer-Encoding: chunked
        Trailer: x-sum, x-count

        3
        abc
        0
        X-Sum: 3

    "});
    let response = exchange(&mut client, &raw).await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("connection: close\r\n"));
}

#[tokio::test]
async fn handler_sees_trailer_validation_error() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        let outcome = match request.into_body().collect().await {
            Ok(_) => "ok".to_string(),
            Err(ParseError::InvalidTrailer { .. }) => "invalid trailer".to_string(),
            Err(e) => format!("other: {e}"),
        };
        Ok::<_, BoxError>(text(outcome))
    }));

    let raw = "POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nX-Undeclared: 1\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    assert!(response.ends_with("invalid trailer"), "{response}");
    assert!(response.contains("connection: close\r\n"));
}

fn delayed_chunks(chunks: Vec<&'static str>) -> impl Body<Data = Bytes, Error = Infallible> + Send {
    let frames = stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, Infallible>(Frame::data(Bytes::from_static(chunk.as_bytes())))
    });
    StreamBody::new(frames)
}

#[tokio::test]
async fn streamed_responses_are_chunked() {
    let cases: Vec<(Vec<&'static str>, &str)> = vec![
        (vec![], "0\r\n\r\n"),
        (vec!["ab"], "2\r\nab\r\n0\r\n\r\n"),
        (vec!["ab", "cde"], "2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"),
        (vec!["ab", "cde", "0123456789abcdef"], "2\r\nab\r\n3\r\ncde\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n"),
    ];

    for (chunks, expected) in cases {
        let mut client = serve(make_handler(move |_request: Request<ReqBody>| {
            let chunks = chunks.clone();
            async move { Ok::<_, BoxError>(Response::new(delayed_chunks(chunks))) }
        }));

        let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        let (head, body) = response.split_once("\r\n\r\n").unwrap();

        assert!(head.contains("transfer-encoding: chunked"), "{head}");
        assert!(!head.contains("content-length"), "{head}");
        assert_eq!(body, expected);
    }
}

#[tokio::test]
async fn failing_stream_is_not_terminated() {
    let mut client = serve(make_handler(|_request: Request<ReqBody>| async {
        let frames = stream::iter(vec![Ok(Frame::data(Bytes::from_static(b"ab"))), Err(std::io::Error::other("source failed"))]);
        Ok::<_, BoxError>(Response::new(StreamBody::new(frames)))
    }));

    client.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let response = read_all(&mut client).await;

    assert!(response.ends_with("2\r\nab\r\n"), "{response}");
    assert!(!response.contains("0\r\n\r\n"));
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 1);
}

#[tokio::test]
async fn handler_framing_headers_are_honoured() {
    let mut client = serve(make_handler(|_request: Request<ReqBody>| async {
        let mut response = text("abc");
        response.headers_mut().insert("transfer-encoding", "chunked".parse().unwrap());
        Ok::<_, BoxError>(response)
    }));

    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;

    assert!(!response.contains("content-length"));
    assert!(response.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"), "{response}");
}

#[tokio::test]
async fn continue_is_sent_when_the_handler_reads() {
    let mut client = serve(make_handler(echo));

    client.write_all(b"POST / HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n").await.unwrap();
    let interim = read_until(&mut client, "\r\n\r\n").await;
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    let response = exchange(&mut client, "hello").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"));
}

#[tokio::test]
async fn continue_is_never_sent_when_the_body_is_ignored() {
    let mut client = serve(make_handler(hello));

    client.write_all(b"POST / HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n").await.unwrap();
    let response = read_all(&mut client).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(!response.contains("100 Continue"));
    assert!(response.contains("connection: close\r\n"));
}

#[tokio::test]
async fn zero_length_body_never_waits_for_continue() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        Ok::<_, BoxError>(text(request.uri().path().to_string()))
    }));

    let raw = crlf(indoc! {"
        POST /a HTTP/1.1
        Host: a
        Expect: 100-continue
        Content-Length: 0

        GET /b HTTP/1.1
        Host: a

    "});
    let response = exchange(&mut client, &raw).await;

    assert!(!response.contains("100 Continue"), "{response}");
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2, "{response}");
    assert!(!response.contains("connection: close"), "{response}");
    assert!(response.ends_with("/b"), "{response}");

    let mut client = serve(make_handler(echo));
    let raw = "POST / HTTP/1.1\r\nHost: a\r\nExpect: 100-continue\r\nContent-Length: 0\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(!response.contains("100 Continue"), "{response}");
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        Ok::<_, BoxError>(text(request.uri().path().to_string()))
    }));

    let raw = "GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\nGET /three HTTP/1.1\r\nHost: a\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    let one = response.find("/one").unwrap();
    let two = response.find("/two").unwrap();
    let three = response.find("/three").unwrap();
    assert!(one < two && two < three);
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 3);
    assert!(!response.contains("connection: close"));
}

#[tokio::test]
async fn unread_body_is_drained_before_the_next_request() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        Ok::<_, BoxError>(text(request.uri().path().to_string()))
    }));

    let raw = crlf(indoc! {"
        POST /ignored HTTP/1.1
        Host: a
        Transfer-Encoding: chunked

        4
        abcd
        0

        GET /next HTTP/1.1
        Host: a

    "});
    let response = exchange(&mut client, &raw).await;

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2, "{response}");
    assert!(response.ends_with("/next"));
}

#[tokio::test]
async fn close_requests_end_the_connection() {
    for raw in ["GET / HTTP/1.0\r\nHost: a\r\n\r\n", "GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"] {
        let mut client = serve(make_handler(hello));

        // the write side stays open: the server has to close on its own
        client.write_all(raw.as_bytes()).await.unwrap();
        let response = read_all(&mut client).await;

        assert!(response.contains("connection: close\r\n"), "{response}");
        assert!(response.ends_with("hello"));
    }
}

#[tokio::test]
async fn handler_errors_and_panics_become_500() {
    let mut client = serve(make_handler(|request: Request<ReqBody>| async move {
        match request.uri().path() {
            "/fail" => Err::<Response<Full<Bytes>>, BoxError>("database exploded".into()),
            "/panic" => panic!("handler bug"),
            _ => Ok(text("fine")),
        }
    }));

    let raw = "GET /fail HTTP/1.1\r\nHost: a\r\n\r\nGET /panic HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let response = exchange(&mut client, raw).await;

    assert_eq!(response.matches("HTTP/1.1 500 Internal Server Error\r\n").count(), 2, "{response}");
    assert!(!response.contains("database exploded"));
    assert!(response.ends_with("fine"));
}

struct Unavailable;

#[async_trait]
impl ErrorHook for Unavailable {
    async fn on_error(&self, _error: &(dyn std::error::Error + Send + Sync + 'static)) -> Result<Response<Full<Bytes>>, BoxError> {
        Ok(status_response(StatusCode::SERVICE_UNAVAILABLE))
    }
}

struct Broken;

#[async_trait]
impl ErrorHook for Broken {
    async fn on_error(&self, _error: &(dyn std::error::Error + Send + Sync + 'static)) -> Result<Response<Full<Bytes>>, BoxError> {
        Err("hook failed".into())
    }
}

async fn failing(_request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
    Err("nope".into())
}

#[tokio::test]
async fn error_hook_chooses_the_response() {
    let mut client = serve_with_hook(make_handler(failing), Some(Arc::new(Unavailable)));
    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{response}");

    let mut client = serve_with_hook(make_handler(failing), Some(Arc::new(Broken)));
    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
}

#[tokio::test]
async fn response_trailers_are_written_after_the_last_chunk() {
    let mut client = serve(make_handler(|_request: Request<ReqBody>| async {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        let frames = stream::iter(vec![Ok::<_, Infallible>(Frame::data(Bytes::from_static(b"abc"))), Ok(Frame::trailers(trailers))]);
        Ok::<_, BoxError>(Response::new(StreamBody::new(frames)))
    }));

    let response = exchange(&mut client, "GET / HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(response.ends_with("3\r\nabc\r\n0\r\nx-checksum: abc\r\n\r\n"), "{response}");
}
