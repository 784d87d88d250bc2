#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_openssl::SslStream;
use wiretap_net::{
    BodyDecoder, BodyFraming, RequestHead, ResponseHead, Signer, TlsConfig, build_acceptor,
};
use wiretap_proxy::{BufferedStream, CONNECT_ESTABLISHED, Proxy, ProxyConfig, ProxyError};
use wiretap_storage::BodyCapture;

pub struct RunningProxy {
    pub proxy: Proxy,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    pub fn root(&self) -> X509 {
        self.proxy.signer().root().certificate().clone()
    }

    pub async fn stop(mut self) -> Result<(), ProxyError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("proxy task panicked")
    }
}

pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listen.host = "127.0.0.1".to_string();
    config.listen.port = 0;
    config.statistics.log_interval_secs = 0;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let proxy = Proxy::new(config).unwrap();
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let server = proxy.clone();
    let handle = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
    });
    RunningProxy {
        proxy,
        addr,
        shutdown: Some(tx),
        handle,
    }
}

/// Origin server that answers every request with `hello from <target>` and
/// remembers what it was sent.
#[derive(Clone)]
pub struct Origin {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<RequestHead>>>,
    pub accepted: Arc<AtomicUsize>,
}

impl Origin {
    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RequestHead> {
        self.seen.lock().unwrap().clone()
    }
}

pub async fn start_plain_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = Origin {
        addr: listener.local_addr().unwrap(),
        seen: Arc::default(),
        accepted: Arc::default(),
    };
    let server = origin.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server.accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_origin(BufferedStream::new(stream), server.seen.clone()));
        }
    });
    origin
}

pub async fn start_tls_origin(signer: &Signer) -> Origin {
    let leaf = signer.sign(&["127.0.0.1"]).unwrap();
    let acceptor = Arc::new(build_acceptor(&TlsConfig::default(), &leaf).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = Origin {
        addr: listener.local_addr().unwrap(),
        seen: Arc::default(),
        accepted: Arc::default(),
    };
    let server = origin.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server.accepted.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let seen = server.seen.clone();
            tokio::spawn(async move {
                let ssl = Ssl::new(acceptor.context()).unwrap();
                let mut tls = SslStream::new(ssl, stream).unwrap();
                if Pin::new(&mut tls).accept().await.is_ok() {
                    serve_origin(BufferedStream::new(tls), seen).await;
                }
            });
        }
    });
    origin
}

async fn serve_origin<S>(mut stream: BufferedStream<S>, seen: Arc<Mutex<Vec<RequestHead>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(Some(request)) = stream.read_request_head().await {
        let framing = BodyFraming::for_request(&request).unwrap();
        let mut decoder = BodyDecoder::new(framing);
        let mut body = Vec::new();
        if stream
            .relay_body(&mut decoder, &mut body, &mut BodyCapture::new(0))
            .await
            .is_err()
        {
            return;
        }
        let reply = format!("hello from {}", request.line.target);
        seen.lock().unwrap().push(request);
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: test\r\n\r\n",
            reply.len()
        );
        if stream.write_all(head.as_bytes()).await.is_err()
            || stream.write_all(reply.as_bytes()).await.is_err()
            || stream.flush().await.is_err()
        {
            return;
        }
    }
}

pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Opens a CONNECT tunnel and checks the established line.
pub async fn open_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let connect = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(connect.as_bytes()).await.unwrap();
    let mut established = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut established).await.unwrap();
    assert_eq!(established, CONNECT_ESTABLISHED);
    stream
}

/// TLS client that trusts only `root` and checks the certificate names
/// 127.0.0.1.
pub async fn tls_client(stream: TcpStream, root: &X509) -> SslStream<TcpStream> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder.cert_store_mut().add_cert(root.clone()).unwrap();
    builder.set_verify(SslVerifyMode::PEER);
    let ssl = builder
        .build()
        .configure()
        .unwrap()
        .into_ssl("127.0.0.1")
        .unwrap();
    let mut tls = SslStream::new(ssl, stream).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    tls
}

pub async fn exchange<S>(stream: &mut BufferedStream<S>, request: &str) -> (ResponseHead, Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    let head = stream.read_response_head().await.unwrap().unwrap();
    let framing = BodyFraming::for_response(&head, "GET").unwrap();
    let mut decoder = BodyDecoder::new(framing);
    let mut wire = Vec::new();
    let mut capture = BodyCapture::new(usize::MAX);
    stream
        .relay_body(&mut decoder, &mut wire, &mut capture)
        .await
        .unwrap();
    let (body, _, _) = capture.into_parts();
    (head, body)
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
