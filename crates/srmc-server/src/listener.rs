use axum::Router;
use axum::extract::Extension;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, warn};

use srmc_gateway::PeerInfo;

/// Accept plaintext connections until `shutdown` fires.
pub async fn run_plain(listener: TcpListener, app: Router, shutdown: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        serve(stream, app.clone(), PeerInfo { addr, secure: false });
    }
}

/// Accept TLS connections until `shutdown` fires. The TLS handshake runs on
/// the connection's own task so a slow client cannot stall the loop.
pub async fn run_tls(listener: TcpListener, acceptor: TlsAcceptor, app: Router, shutdown: CancellationToken) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("TLS accept failed: {}", e);
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => serve(tls_stream, app, PeerInfo { addr, secure: true }),
                Err(e) => debug!("TLS handshake with {} failed: {}", addr, e),
            }
        });
    }
}

/// Serve one HTTP connection (with upgrades) and tag its requests with the
/// peer's address and transport.
fn serve<S>(stream: S, app: Router, peer: PeerInfo)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let svc = app.layer(Extension(peer));
    tokio::spawn(async move {
        let hyper_service =
            hyper::service::service_fn(move |req: Request<Incoming>| svc.clone().call(req));

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(TokioIo::new(stream), hyper_service)
            .await
        {
            debug!("Connection from {} ended: {}", peer.addr, e);
        }
    });
}
