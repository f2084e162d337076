//! Request/response method calls over an [`IpcBus`].
//!
//! Requests travel on `rpc-request`, responses on `rpc-response`. Each call
//! attempt gets a fresh request id; failed attempts are retried with
//! exponential backoff.

use crate::bus::{IpcBus, SendOptions};
use crate::envelope::Envelope;
use crate::error::{IpcError, IpcResult};
use enclave_types::MessageId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const REQUEST_CHANNEL: &str = "rpc-request";
pub const RESPONSE_CHANNEL: &str = "rpc-response";

/// Error codes carried in [`RpcError::code`].
pub mod codes {
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Typed RPC failure, reconstructed on the calling side from the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.to_string(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(codes::EXECUTION_ERROR, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl RpcRequest {
    /// Validates an inbound payload. Returns the request id (if any) on failure
    /// so the error response can still be correlated.
    fn parse(payload: &Value) -> Result<Self, (String, RpcError)> {
        let id = payload.get("id").and_then(Value::as_str).map(str::to_string);
        let method = payload.get("method").and_then(Value::as_str);
        let args = payload.get("args").and_then(Value::as_array);
        match (id, method, args) {
            (Some(id), Some(method), Some(args)) if !method.is_empty() => Ok(Self {
                id,
                method: method.to_string(),
                args: args.clone(),
            }),
            (id, _, _) => Err((
                id.unwrap_or_default(),
                RpcError::new(codes::INVALID_REQUEST, "invalid RPC request"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub status: RpcStatus,
}

impl RpcResponse {
    pub fn success(id: String, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            status: RpcStatus::Success,
        }
    }

    pub fn failure(id: String, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            status: RpcStatus::Error,
        }
    }

    fn into_result(self) -> Result<Value, RpcError> {
        match self.status {
            RpcStatus::Success => Ok(self.result.unwrap_or(Value::Null)),
            RpcStatus::Error => Err(self
                .error
                .unwrap_or_else(|| RpcError::internal("error response without error"))),
        }
    }
}

// ── Method registry ──────────────────────────────────────────────

pub type MethodFuture = BoxFuture<'static, Result<Value, RpcError>>;
pub type Method = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// Named methods callable over RPC. Clones share the same table.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Arc<RwLock<HashMap<String, Method>>>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Fails if the name is taken.
    pub fn register<F, Fut>(&self, name: &str, method: F) -> IpcResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let boxed: Method = Arc::new(move |args| Box::pin(method(args)));
        let mut methods = self.methods.write().unwrap();
        if methods.contains_key(name) {
            return Err(IpcError::DuplicateMethod(name.to_string()));
        }
        methods.insert(name.to_string(), boxed);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.methods.write().unwrap().remove(name).is_some()
    }

    /// Removes every method whose name starts with `prefix`.
    pub fn unregister_prefix(&self, prefix: &str) -> usize {
        let mut methods = self.methods.write().unwrap();
        let before = methods.len();
        methods.retain(|name, _| !name.starts_with(prefix));
        before - methods.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs a registered method in the current context.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let method = self.methods.read().unwrap().get(name).cloned();
        match method {
            Some(method) => method(args).await,
            None => Err(RpcError::method_not_found(name)),
        }
    }
}

// ── RPC manager ──────────────────────────────────────────────────

/// Timeout, retry and backoff defaults.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 0,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

impl RpcConfig {
    /// Delay before retry number `attempt + 1`: `min(base * 2^attempt, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Options for one [`RpcManager::call_method`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub method: String,
    pub args: Vec<Value>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl CallOptions {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Receives every RPC error seen by a manager, with a short context label.
pub type ErrorHandler = Arc<dyn Fn(&RpcError, &str) + Send + Sync>;

struct RpcInner {
    bus: IpcBus,
    registry: MethodRegistry,
    config: RpcConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
    error_handler: RwLock<ErrorHandler>,
}

/// RPC endpoint bound to one bus. Serves `registry` and calls the peer.
#[derive(Clone)]
pub struct RpcManager {
    inner: Arc<RpcInner>,
}

impl RpcManager {
    pub fn new(bus: IpcBus, registry: MethodRegistry, config: RpcConfig) -> Self {
        let default_handler: ErrorHandler = Arc::new(|error, context| {
            warn!(code = %error.code, context, "rpc error: {}", error.message);
        });
        let inner = Arc::new(RpcInner {
            bus: bus.clone(),
            registry,
            config,
            pending: Mutex::new(HashMap::new()),
            error_handler: RwLock::new(default_handler),
        });

        let weak = Arc::downgrade(&inner);
        bus.on(REQUEST_CHANNEL, move |envelope| {
            if let Some(inner) = weak.upgrade() {
                handle_request(inner, envelope);
            }
        });
        let weak = Arc::downgrade(&inner);
        bus.on(RESPONSE_CHANNEL, move |envelope| {
            if let Some(inner) = weak.upgrade() {
                handle_response(&inner, envelope);
            }
        });

        Self { inner }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &IpcBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub fn register_method<F, Fut>(&self, name: &str, method: F) -> IpcResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.inner.registry.register(name, method)
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&RpcError, &str) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write().unwrap() = Arc::new(handler);
    }

    /// Calls a method on the peer, retrying failed attempts with backoff.
    pub async fn call_method(&self, options: CallOptions) -> Result<Value, RpcError> {
        let timeout = options.timeout.unwrap_or(self.inner.config.timeout);
        let retries = options.retries.unwrap_or(self.inner.config.retries);

        let mut last_error = RpcError::internal("no attempt made");
        for attempt in 0..=retries {
            if attempt > 0 {
                let delay = self.inner.config.backoff(attempt - 1);
                debug!(
                    method = %options.method,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying rpc call"
                );
                tokio::time::sleep(delay).await;
            }
            match self.attempt(&options.method, &options.args, timeout).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    report(&self.inner, &e, "call");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn attempt(
        &self,
        method: &str,
        args: &[Value],
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request = RpcRequest {
            id: MessageId::new().to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        };
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(request.id.clone(), tx);

        let payload = serde_json::to_value(&request)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        if let Err(e) = self
            .inner
            .bus
            .send(REQUEST_CHANNEL, payload, SendOptions::default())
        {
            self.inner.pending.lock().unwrap().remove(&request.id);
            return Err(RpcError::internal(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(RpcError::internal("rpc manager dropped")),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&request.id);
                Err(RpcError::new(
                    codes::TIMEOUT,
                    format!("{method} timed out after {}ms", timeout.as_millis()),
                ))
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

fn report(inner: &RpcInner, error: &RpcError, context: &str) {
    let handler = inner.error_handler.read().unwrap().clone();
    handler(error, context);
}

fn handle_request(inner: Arc<RpcInner>, envelope: &Envelope) {
    let source = envelope.metadata.source.clone();
    let request = RpcRequest::parse(&envelope.payload);

    tokio::spawn(async move {
        let response = match request {
            Ok(request) => match inner.registry.invoke(&request.method, request.args).await {
                Ok(result) => RpcResponse::success(request.id, result),
                Err(e) if e.is(codes::METHOD_NOT_FOUND) => {
                    report(&inner, &e, "request");
                    RpcResponse::failure(request.id, e)
                }
                Err(e) => {
                    // Method failures always surface as EXECUTION_ERROR, keeping the cause in data.
                    let error = if e.is(codes::EXECUTION_ERROR) {
                        e
                    } else {
                        RpcError::execution(e.message.clone())
                            .with_data(serde_json::to_value(&e).unwrap_or(Value::Null))
                    };
                    report(&inner, &error, "request");
                    RpcResponse::failure(request.id, error)
                }
            },
            Err((id, e)) => {
                report(&inner, &e, "request");
                RpcResponse::failure(id, e)
            }
        };

        let payload = match serde_json::to_value(&response) {
            Ok(p) => p,
            Err(e) => {
                report(&inner, &RpcError::internal(e.to_string()), "response");
                return;
            }
        };
        let sent = inner.bus.send(
            RESPONSE_CHANNEL,
            payload,
            SendOptions {
                id: None,
                target: Some(source),
            },
        );
        if let Err(e) = sent {
            report(&inner, &RpcError::internal(e.to_string()), "response");
        }
    });
}

fn handle_response(inner: &RpcInner, envelope: &Envelope) {
    let response: RpcResponse = match serde_json::from_value(envelope.payload.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping malformed rpc response");
            return;
        }
    };
    let waiter = inner.pending.lock().unwrap().remove(&response.id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => debug!(id = %response.id, "ignoring rpc response with unknown id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = RpcConfig {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(350),
            ..RpcConfig::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(350));
        assert_eq!(cfg.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn request_validation() {
        assert!(RpcRequest::parse(&json!({"id": "1", "method": "m", "args": []})).is_ok());

        let (id, e) = RpcRequest::parse(&json!({"id": "2", "method": "", "args": []})).unwrap_err();
        assert_eq!(id, "2");
        assert!(e.is(codes::INVALID_REQUEST));

        assert!(RpcRequest::parse(&json!({"id": "3", "method": "m", "args": {}})).is_err());
        assert!(RpcRequest::parse(&json!({"id": 4, "method": "m", "args": []})).is_err());
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_reports_missing() {
        let reg = MethodRegistry::new();
        reg.register("a.echo", |args| async move { Ok(json!(args)) }).unwrap();
        assert!(matches!(
            reg.register("a.echo", |_| async { Ok(Value::Null) }),
            Err(IpcError::DuplicateMethod(_))
        ));

        assert_eq!(reg.invoke("a.echo", vec![json!(1)]).await.unwrap(), json!([1]));
        let err = reg.invoke("nope", vec![]).await.unwrap_err();
        assert!(err.is(codes::METHOD_NOT_FOUND));

        reg.register("a.other", |_| async { Ok(Value::Null) }).unwrap();
        reg.register("b.x", |_| async { Ok(Value::Null) }).unwrap();
        assert_eq!(reg.unregister_prefix("a."), 2);
        assert_eq!(reg.names(), vec!["b.x".to_string()]);
    }

    #[test]
    fn error_response_round_trip() {
        let resp = RpcResponse::failure("9".into(), RpcError::method_not_found("doesNotExist"));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["code"], "METHOD_NOT_FOUND");
        let back: RpcResponse = serde_json::from_value(v).unwrap();
        assert!(back.into_result().unwrap_err().is(codes::METHOD_NOT_FOUND));
    }
}
