//! Validated, optionally encrypted and signed message bus over a port.

use crate::envelope::{signing_bytes, Envelope, MessageType, Metadata};
use crate::error::{IpcError, IpcResult};
use crate::port::{PortEnd, PortMessage, PortSender, ANY_ORIGIN};
use enclave_crypto::{decrypt_json, encrypt_json, signing, ChannelKey};
use enclave_types::{MessageId, Timestamp};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bus configuration for one side of a port.
#[derive(Clone, Default)]
pub struct IpcConfig {
    /// Origin this context identifies as in `metadata.source`.
    pub origin: String,
    /// Origin messages are posted to and accepted from (`*` for any).
    pub allowed_origin: String,
    pub enable_encryption: bool,
    pub encryption_key: Option<ChannelKey>,
    pub enable_authentication: bool,
    pub auth_token: Option<String>,
}

impl fmt::Debug for IpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcConfig")
            .field("origin", &self.origin)
            .field("allowed_origin", &self.allowed_origin)
            .field("enable_encryption", &self.enable_encryption)
            .field("enable_authentication", &self.enable_authentication)
            .finish_non_exhaustive()
    }
}

impl IpcConfig {
    pub fn new(origin: impl Into<String>, allowed_origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            allowed_origin: allowed_origin.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_encryption(mut self, key: ChannelKey) -> Self {
        self.enable_encryption = true;
        self.encryption_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_authentication(mut self, token: impl Into<String>) -> Self {
        self.enable_authentication = true;
        self.auth_token = Some(token.into());
        self
    }

    /// Fails when a feature is enabled without its secret.
    pub fn validate(&self) -> IpcResult<()> {
        if self.origin.is_empty() {
            return Err(IpcError::Config("origin is required".into()));
        }
        if self.allowed_origin.is_empty() {
            return Err(IpcError::Config("allowed origin is required".into()));
        }
        if self.enable_encryption && self.encryption_key.is_none() {
            return Err(IpcError::Config(
                "encryption enabled without an encryption key".into(),
            ));
        }
        if self.enable_authentication && self.auth_token.as_deref().is_none_or(str::is_empty) {
            return Err(IpcError::Config(
                "authentication enabled without an auth token".into(),
            ));
        }
        Ok(())
    }
}

/// Extra metadata for [`IpcBus::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Reuse this id instead of allocating one (responses).
    pub id: Option<String>,
    pub target: Option<String>,
}

/// Identifies a registered channel handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct BusInner {
    config: IpcConfig,
    sender: PortSender,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    next_handler: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// One context's side of an IPC channel.
///
/// Construction spawns the receive loop on the current tokio runtime.
/// Clones share the same loop, handlers and pending requests.
#[derive(Clone)]
pub struct IpcBus {
    inner: Arc<BusInner>,
}

impl IpcBus {
    pub fn new(config: IpcConfig, port: PortEnd) -> IpcResult<Self> {
        config.validate()?;
        let PortEnd { sender, receiver } = port;
        let inner = Arc::new(BusInner {
            config,
            sender,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(receive_loop(inner.clone(), receiver));
        *inner.task.lock().unwrap() = Some(handle);
        Ok(Self { inner })
    }

    pub fn origin(&self) -> &str {
        &self.inner.config.origin
    }

    /// Builds, signs, encrypts and posts an envelope. Returns its id.
    pub fn send(&self, channel: &str, payload: Value, options: SendOptions) -> IpcResult<String> {
        let config = &self.inner.config;
        let id = options.id.unwrap_or_else(|| MessageId::new().to_string());

        let signature = match (&config.auth_token, config.enable_authentication) {
            (Some(token), true) => Some(signing::sign(token, &signing_bytes(&payload))),
            _ => None,
        };
        let payload = match (&config.encryption_key, config.enable_encryption) {
            (Some(key), true) => encrypt_json(key, &payload)?,
            _ => payload,
        };

        let envelope = Envelope {
            channel: channel.to_string(),
            kind: MessageType::Ipc,
            payload,
            metadata: Metadata {
                id: id.clone(),
                timestamp: Timestamp::now(),
                source: config.origin.clone(),
                target: options.target,
                signature,
            },
        };
        let data = serde_json::to_value(&envelope)?;
        self.inner.sender.post(data, &config.allowed_origin)?;
        Ok(id)
    }

    /// Sends and waits for a message targeted at this origin with the same id.
    pub async fn request(
        &self,
        channel: &str,
        payload: Value,
        timeout: Duration,
    ) -> IpcResult<Envelope> {
        let id = MessageId::new().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        let sent = self.send(
            channel,
            payload,
            SendOptions {
                id: Some(id.clone()),
                target: None,
            },
        );
        if let Err(e) = sent {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(IpcError::PortClosed),
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(IpcError::Timeout {
                    channel: channel.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Replies to `request` on its channel, same id, targeted at its source.
    pub fn respond(&self, request: &Envelope, payload: Value) -> IpcResult<String> {
        self.send(
            &request.channel,
            payload,
            SendOptions {
                id: Some(request.metadata.id.clone()),
                target: Some(request.metadata.source.clone()),
            },
        )
    }

    /// Registers a handler for `channel`. Handlers run in registration order.
    pub fn on<F>(&self, channel: &str, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one handler. Returns whether it was registered.
    pub fn off(&self, channel: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().unwrap();
        let Some(list) = handlers.get_mut(channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(channel);
        }
        removed
    }

    /// Forwards every message on `channel` into an mpsc receiver.
    pub fn subscribe(&self, channel: &str) -> (HandlerId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(channel, move |env| {
            let _ = tx.send(env.clone());
        });
        (id, rx)
    }

    /// Stops the receive loop and drops all handlers and pending requests.
    pub fn close(&self) {
        if let Some(task) = self.inner.task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.handlers.write().unwrap().clear();
        self.inner.pending.lock().unwrap().clear();
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

async fn receive_loop(inner: Arc<BusInner>, mut receiver: mpsc::UnboundedReceiver<PortMessage>) {
    while let Some(message) = receiver.recv().await {
        let Some(envelope) = accept(&inner.config, message) else {
            continue;
        };
        dispatch(&inner, envelope);
    }
    debug!(origin = %inner.config.origin, "message port closed");
}

/// Origin check, shape validation, decryption and signature check.
fn accept(config: &IpcConfig, message: PortMessage) -> Option<Envelope> {
    if config.allowed_origin != ANY_ORIGIN && message.origin != config.allowed_origin {
        warn!(
            origin = %message.origin,
            expected = %config.allowed_origin,
            "dropping message from unexpected origin"
        );
        return None;
    }

    let Some(mut envelope) = Envelope::from_value(message.data) else {
        warn!(origin = %message.origin, "dropping malformed message");
        return None;
    };

    if let (Some(key), true) = (&config.encryption_key, config.enable_encryption) {
        match decrypt_json(key, &envelope.payload) {
            Ok(plain) => envelope.payload = plain,
            Err(e) => {
                warn!(channel = %envelope.channel, error = %e, "failed to decrypt message");
                return None;
            }
        }
    }

    if let (Some(token), true) = (&config.auth_token, config.enable_authentication) {
        let valid = envelope
            .metadata
            .signature
            .as_deref()
            .is_some_and(|sig| signing::verify(token, &signing_bytes(&envelope.payload), sig));
        if !valid {
            warn!(channel = %envelope.channel, "Invalid message signature");
            return None;
        }
    }

    Some(envelope)
}

fn dispatch(inner: &BusInner, envelope: Envelope) {
    if envelope.target() == Some(inner.config.origin.as_str()) {
        let waiter = inner.pending.lock().unwrap().remove(envelope.id());
        if let Some(tx) = waiter {
            let _ = tx.send(envelope);
            return;
        }
    }

    let handlers: Vec<Handler> = inner
        .handlers
        .read()
        .unwrap()
        .get(&envelope.channel)
        .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();

    if handlers.is_empty() {
        debug!(channel = %envelope.channel, "no handler for channel");
    }
    for handler in handlers {
        handler(&envelope);
    }
}
