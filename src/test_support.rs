//! Local origin servers for network tests

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::http::wire::{self, ParsedRequest};
use crate::http::HttpResponse;
use crate::proxy::{CertificateAuthority, CertificateProvider};

type Handler = Arc<dyn Fn(&ParsedRequest) -> HttpResponse + Send + Sync>;

/// Plain HTTP origin on 127.0.0.1; returns its base URL
pub(crate) async fn spawn_origin<F>(handler: F) -> String
where
    F: Fn(&ParsedRequest) -> HttpResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler: Handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, handler.clone()));
        }
    });

    format!("http://{}", addr)
}

/// HTTPS origin answering for `localhost`; returns its port
pub(crate) async fn spawn_tls_origin<F>(handler: F) -> u16
where
    F: Fn(&ParsedRequest) -> HttpResponse + Send + Sync + 'static,
{
    let provider = Arc::new(CertificateProvider::new(
        CertificateAuthority::new().unwrap(),
        "/tmp/gleip-origin-ca.pem",
        "localhost",
    ));
    provider.generate_certificate("localhost").await.unwrap();
    let acceptor = TlsAcceptor::from(provider.server_config().unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler: Handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve(tls, handler).await;
                }
            });
        }
    });

    port
}

async fn serve<S>(stream: S, handler: Handler)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    while let Ok(Some(request)) = wire::read_request(&mut stream).await {
        let response = handler(&request);
        if wire::write_response(&mut stream, &response, false).await.is_err() {
            break;
        }
    }
}
