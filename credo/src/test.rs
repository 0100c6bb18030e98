#![allow(dead_code)]

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use credo_clock::{ManualClock, UnixTime};
use http::StatusCode;

use crate::{
    transport::{HttpRequest, HttpResponse, Transport, TransportError, TransportErrorKind},
    Context, MapEnv,
};

pub const NOW: UnixTime = UnixTime(1_700_000_000);

pub const PRIVATE_KEY_PEM: &str = include_str!("../../credo_jose/data/rsa/private.pem");
pub const PUBLIC_JWK: &str = include_str!("../../credo_jose/data/rsa/jwk.json");

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// A transport that answers from a closure and records every request
pub struct FakeTransport {
    handler: Box<Handler>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FakeTransport")
            .field("calls", &self.calls())
            .field("latency", &self.latency)
            .finish()
    }
}

impl FakeTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self::new(|_| Err(connection_refused()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(&request)
    }
}

pub fn connection_refused() -> TransportError {
    TransportError::new(TransportErrorKind::Connect, "connection refused")
}

pub fn json(status: StatusCode, value: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, value.to_string())
}

pub fn ok_json(value: serde_json::Value) -> HttpResponse {
    json(StatusCode::OK, value)
}

pub fn access_token_response(token: &str, expires_in: u64) -> HttpResponse {
    ok_json(serde_json::json!({
        "access_token": token,
        "expires_in": expires_in,
        "token_type": "Bearer",
    }))
}

pub fn form(request: &HttpRequest) -> HashMap<String, String> {
    url::form_urlencoded::parse(&request.body)
        .into_owned()
        .collect()
}

pub fn json_body(request: &HttpRequest) -> serde_json::Value {
    serde_json::from_slice(&request.body).unwrap()
}

pub fn authorization(request: &HttpRequest) -> Option<&str> {
    request
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// A context over the given transport, a manual clock at [`NOW`], and an
/// empty environment
pub fn context(transport: Arc<FakeTransport>) -> (Context, ManualClock) {
    let clock = ManualClock::new(NOW);
    let ctx = Context::new(transport)
        .with_clock(clock.clone())
        .with_env(MapEnv::default());
    (ctx, clock)
}

pub fn service_account_json(token_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "service_account",
        "project_id": "fixture-project",
        "private_key_id": "fixture-key-1",
        "private_key": PRIVATE_KEY_PEM,
        "client_email": "robot@fixture-project.iam.gserviceaccount.com",
        "client_id": "1234567890",
        "token_uri": token_uri,
    })
}
