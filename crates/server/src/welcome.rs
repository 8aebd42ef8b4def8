use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, Response};
use http_body_util::Full;
use portico_http::handler::BoxError;
use portico_http::protocol::body::ReqBody;

/// The handler the `portico` binary serves: reads the whole request body and
/// reports what it received as plain text.
pub async fn welcome(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
    let (parts, body) = request.into_parts();

    let mut trailers = HeaderMap::new();
    let received = body.collect_into(&mut trailers).await?;

    let text = format!(
        "portico {}\n{} {}\nreceived {} bytes, {} trailers\n",
        env!("CARGO_PKG_VERSION"),
        parts.method,
        parts.uri,
        received.len(),
        trailers.len()
    );

    Ok(Response::builder().header(CONTENT_TYPE, "text/plain; charset=utf-8").body(Full::new(Bytes::from(text)))?)
}
