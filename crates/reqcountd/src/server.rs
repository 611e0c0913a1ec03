use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use percent_encoding::percent_decode_str;
use reqcount_core::report::{render_not_found, render_report};
use reqcount_core::util::http_date;
use reqcount_core::{RequestCounter, WINDOW};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

pub type Body = Full<Bytes>;

/// Per-connection limits: how long a client may take to send its request
/// head, how long the whole connection may live, and the largest head
/// accepted.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub header_read: Duration,
    pub lifetime: Duration,
    pub max_header_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            header_read: Duration::from_secs(10),
            // read limit plus write limit
            lifetime: Duration::from_secs(20),
            max_header_bytes: 1 << 20,
        }
    }
}

type Handler = fn(&Method, &RequestCounter) -> Response<Body>;

/// Path to handler map; anything unregistered is a 404.
#[derive(Clone)]
pub struct Dispatcher {
    routes: Arc<HashMap<&'static str, Handler>>,
    counter: Arc<RequestCounter>,
}

impl Dispatcher {
    pub fn new(counter: Arc<RequestCounter>) -> Self {
        let mut routes: HashMap<&'static str, Handler> = HashMap::new();
        routes.insert("/", serve_report);
        Self {
            routes: Arc::new(routes),
            counter,
        }
    }

    pub fn dispatch(&self, method: &Method, path: &str) -> Response<Body> {
        let response = match self.routes.get(path) {
            Some(handler) => handler(method, &self.counter),
            None => text(StatusCode::NOT_FOUND, render_not_found(path)),
        };
        debug!(%method, path, status = response.status().as_u16(), "request");
        response
    }
}

fn serve_report(method: &Method, counter: &RequestCounter) -> Response<Body> {
    if *method != Method::GET {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, String::new());
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }
    counter.increment();
    let served = counter.window_total();
    text(StatusCode::OK, render_report(served, WINDOW, &http_date()))
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub async fn serve_connection<I>(
    io: I,
    dispatcher: Dispatcher,
    limits: ConnectionLimits,
) -> Result<(), hyper::Error>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let path = percent_decode_str(req.uri().path()).decode_utf8_lossy();
        let response = dispatcher.dispatch(req.method(), &path);
        async move { Ok::<_, Infallible>(response) }
    });
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read)
        .max_buf_size(limits.max_header_bytes)
        .serve_connection(TokioIo::new(io), service);
    match tokio::time::timeout(limits.lifetime, conn).await {
        Ok(result) => result,
        Err(_) => {
            debug!("connection lifetime exceeded, closing");
            Ok(())
        }
    }
}

/// Accepts connections forever, one task per connection.
pub async fn run(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    limits: ConnectionLimits,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => serve_connection(tls, dispatcher, limits).await,
                    Err(err) => {
                        warn!(%peer, %err, "tls handshake failed");
                        return;
                    }
                },
                None => serve_connection(stream, dispatcher, limits).await,
            };
            if let Err(err) = result {
                warn!(%peer, %err, "connection error");
            }
        });
    }
}
