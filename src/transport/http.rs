//! The HTTP realization of the transport contract: an [`axum`]-based
//! [`HttpReceiver`] and a [`reqwest`]-based [`HttpSender`].
//!
//! Wire format: every call is a `POST`, arguments travel as query
//! parameters, bodies are either raw bytes or JSON. A `200` response means
//! success; anything else is folded into [`NetfsError::UnexpectedAnswer`]
//! with the status and response body preserved verbatim.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{NetfsError, Result};
use crate::transport::{Handler, Receiver, Request, Response, Sender};

/// Sends requests over HTTP using `reqwest`.
pub struct HttpSender {
    client: reqwest::Client,
    port: u16,
}

impl HttpSender {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, ip: Ipv4Addr, endpoint: &str, params: &[(String, String)], body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let endpoint = endpoint.trim_start_matches('/');
        let url = format!("http://{ip}:{port}/{endpoint}", ip = ip, port = self.port, endpoint = endpoint);

        let mut req = self.client.post(&url).query(params);
        if let Some(bytes) = body {
            req = req.body(bytes);
        }

        let resp = req.send().await.map_err(|e| if e.is_timeout() { NetfsError::Timeout } else { NetfsError::Transport(e) })?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp.bytes().await?.to_vec())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(NetfsError::UnexpectedAnswer { status: status.as_u16(), body })
        }
    }
}

type HandlerTable = Arc<StdMutex<HashMap<String, Arc<dyn Handler>>>>;

/// Serves bound endpoints over HTTP using `axum`.
pub struct HttpReceiver {
    addr: SocketAddr,
    handlers: HandlerTable,
    shutdown: StdMutex<Option<oneshot::Sender<()>>>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl HttpReceiver {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            handlers: Arc::new(StdMutex::new(HashMap::new())),
            shutdown: StdMutex::new(None),
            join: StdMutex::new(None),
        }
    }
}

async fn dispatch(
    handler: Arc<dyn Handler>,
    State(_): State<()>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> AxumResponse {
    let mut request = Request::new(params, body.to_vec());
    if let std::net::IpAddr::V4(ip) = addr.ip() {
        request = request.with_source_ip(ip);
    }

    match handler.handle(request).await {
        Ok(response) => match response.into_bytes() {
            Ok(bytes) => (StatusCode::OK, bytes).into_response(),
            Err(err) => error_response(&err),
        },
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &NetfsError) -> AxumResponse {
    let status = match err {
        NetfsError::Forbidden => StatusCode::FORBIDDEN,
        NetfsError::VolumeNotFound(_) | NetfsError::FileNotFound(_) | NetfsError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        NetfsError::ReadNotPermitted(_) | NetfsError::WriteNotPermitted(_) => StatusCode::FORBIDDEN,
        NetfsError::MalformedVirtualPath(_) | NetfsError::UnknownTaskType(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[async_trait]
impl Receiver for HttpReceiver {
    fn bind(&self, endpoint: &str, handler: Arc<dyn Handler>) {
        self.handlers.lock().expect("handler table lock poisoned").insert(endpoint.to_string(), handler);
    }

    async fn start(&self) -> Result<()> {
        let mut router = Router::new();
        let handlers = self.handlers.lock().expect("handler table lock poisoned").clone();
        for (endpoint, handler) in handlers {
            debug!(endpoint = %endpoint, "binding http route");
            router = router.route(
                &endpoint,
                post(move |connect_info: ConnectInfo<SocketAddr>, query: Query<HashMap<String, String>>, body: Bytes| {
                    dispatch(handler.clone(), State(()), connect_info, query, body)
                }),
            );
        }

        let listener = TcpListener::bind(self.addr).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let join = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "http receiver stopped with an error");
            }
        });

        *self.shutdown.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);
        *self.join.lock().expect("join lock poisoned") = Some(join);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().expect("shutdown lock poisoned").take() {
            let _ = tx.send(());
        }
        let join = self.join.lock().expect("join lock poisoned").take();
        if let Some(join) = join {
            let _ = tokio::time::timeout(Duration::from_secs(5), join).await;
        }
        Ok(())
    }
}
