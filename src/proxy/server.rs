//! MITM transport
//!
//! Explicit forward proxy. Plain absolute-form requests go straight into
//! the session pipeline. CONNECT tunnels are upgraded and then either
//! spliced verbatim (host not watched, or the client process not trapped)
//! or TLS-terminated with a minted leaf and served as decrypted HTTP/1.1
//! sessions. Every connection runs on its own task; sessions never order
//! across connections.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::{uri::Authority, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, net::TcpStream, sync::watch};
use tokio_rustls::TlsAcceptor;

use crate::{
    core::{PluginExecutor, ProxyContext, ProxyError, ProxyResult, RequestData, Session},
    logging::{MessageType, RequestLog},
    proxy::upstream::UpstreamClient,
    system::ProcessFilter,
    tls::CertificateAuthority,
};

pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    executor: Arc<PluginExecutor>,
    ca: Arc<CertificateAuthority>,
    upstream: UpstreamClient,
    process_filter: ProcessFilter,
    session_counter: AtomicU64,
}

impl ProxyServer {
    pub fn new(
        ctx: Arc<ProxyContext>,
        executor: Arc<PluginExecutor>,
        ca: Arc<CertificateAuthority>,
        upstream: UpstreamClient,
        process_filter: ProcessFilter,
    ) -> Self {
        Self {
            ctx,
            executor,
            ca,
            upstream,
            process_filter,
            session_counter: AtomicU64::new(0),
        }
    }

    /// Accept loop. Returns when the shutdown channel flips; in-flight
    /// connections run to completion on their own tasks.
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProxyResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Configuration(format!("Cannot bind {addr}: {e}")))?;
        log::info!("Listening on {addr}");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => log::warn!("Failed to accept connection: {e}"),
                    }
                }
            }
        }

        log::info!("Stopped accepting connections");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.route(req, peer).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            log::debug!("Connection from {peer} ended: {e}");
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        if req.method() == Method::CONNECT {
            let Some(authority) = req.uri().authority().cloned() else {
                return Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    "CONNECT target missing",
                ));
            };

            let server = self.clone();
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => server.handle_connect(upgraded, authority, peer).await,
                    Err(e) => log::error!("CONNECT upgrade failed: {e}"),
                }
            });
            return Ok(Response::new(Full::new(Bytes::new())));
        }

        if req.uri().scheme().is_none() {
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "Absolute request URI required",
            ));
        }

        let url = req.uri().to_string();
        let intercept = self.process_filter.is_watched(peer);
        Ok(self.handle_session(req, url, intercept).await)
    }

    async fn handle_connect(self: Arc<Self>, upgraded: Upgraded, authority: Authority, peer: SocketAddr) {
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);
        let io = TokioIo::new(upgraded);

        let decrypt = self.ctx.watch.matches_host(&host) && self.process_filter.is_watched(peer);
        if !decrypt {
            log::debug!("Tunneling {host}:{port} without decryption");
            tunnel(io, &host, port).await;
            return;
        }

        let tls_config = match self.ca.server_config(&host) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Cannot mint certificate for {host}: {e}; tunneling instead");
                tunnel(io, &host, port).await;
                return;
            }
        };

        let tls_stream = match TlsAcceptor::from(tls_config).accept(io).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("TLS handshake with client failed for {host}: {e}");
                return;
            }
        };

        let url_authority = if port == 443 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            let url_authority = url_authority.clone();
            async move {
                let path = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                let url = format!("https://{url_authority}{path}");
                Ok::<_, Infallible>(server.handle_session(req, url, true).await)
            }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
        {
            log::debug!("Decrypted connection for {host} ended: {e}");
        }
    }

    /// Run one request/response cycle through the plugin phases.
    ///
    /// Phase order within the session: before_request → upstream fetch when
    /// no plugin answered → before_response (real responses only) →
    /// after_response → write → per-record after_request_log → terminal
    /// log record.
    async fn handle_session(
        &self,
        req: Request<Incoming>,
        url: String,
        intercept: bool,
    ) -> Response<Full<Bytes>> {
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                log::error!("Failed to buffer request body for {url}: {e}");
                return plain_response(StatusCode::BAD_GATEWAY, "Failed to read request body");
            }
        };

        let request = RequestData::new(parts.method, url, parts.headers, body);
        let mut session = Session::new(id, request);

        if !intercept {
            if let Err(e) = self.upstream.fetch(&mut session).await {
                log::error!("Upstream fetch for {} failed: {e}", session.request.url);
                return plain_response(StatusCode::BAD_GATEWAY, "Upstream fetch failed");
            }
            return session_response(&session);
        }

        let ctx = &self.ctx;
        ctx.logger.log(
            id,
            RequestLog::single(
                MessageType::InterceptedRequest,
                format!("{} {}", session.request.method, session.request.url),
            ),
        );

        self.executor.before_request(&mut session, ctx).await;

        let mut fetched = false;
        if !session.response_state.has_been_set {
            match self.upstream.fetch(&mut session).await {
                Ok(()) => {
                    fetched = true;
                    ctx.logger.log(
                        id,
                        RequestLog::single(
                            MessageType::InterceptedResponse,
                            session.response.status.to_string(),
                        ),
                    );
                }
                Err(e) => {
                    log::error!("Upstream fetch for {} failed: {e}", session.request.url);
                    ctx.logger
                        .log(id, RequestLog::single(MessageType::Failed, e.to_string()));
                    session.response.status = StatusCode::BAD_GATEWAY;
                    session.response.headers = HeaderMap::new();
                    session.response.body = Bytes::from(format!("Upstream fetch failed: {e}"));
                }
            }
        }

        if fetched && !session.response_state.has_been_set {
            self.executor.before_response(&mut session, ctx).await;
        }
        self.executor.after_response(&mut session, ctx).await;

        if fetched && !session.response_state.has_been_set {
            ctx.logger.log(
                id,
                RequestLog::single(
                    MessageType::PassedThrough,
                    session.response.status.to_string(),
                ),
            );
        }

        let response = session_response(&session);

        let method = session.request.method.to_string();
        let records = ctx.logger.complete(id, &method, &session.request.url);
        for record in &records {
            ctx.state.record_request_log(record.clone());
            self.executor.after_request_log(record, ctx).await;
        }

        response
    }
}

/// Splice a CONNECT tunnel without looking inside it.
async fn tunnel(mut client: TokioIo<Upgraded>, host: &str, port: u16) {
    match TcpStream::connect((host, port)).await {
        Ok(mut server) => {
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await {
                log::debug!("Tunnel to {host}:{port} closed: {e}");
            }
        }
        Err(e) => log::error!("Cannot open tunnel to {host}:{port}: {e}"),
    }
}

fn session_response(session: &Session) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(session.response.status);
    for (name, value) in session.response.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(session.response.body.clone()))
        .unwrap_or_else(|e| {
            log::error!("Failed to build client response: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error")
        })
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("Static response must build")
}
