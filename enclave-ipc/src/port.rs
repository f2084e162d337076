//! Cross-context message ports.
//!
//! A port pair connects exactly two execution contexts. Each end knows its
//! own origin and its peer's; the origin stamped on a delivered message is
//! the sending end's origin and cannot be chosen by the sender.

use crate::error::{IpcError, IpcResult};
use serde_json::Value;
use tokio::sync::mpsc;

/// Origin wildcard accepted as a target origin and as an allowed origin.
pub const ANY_ORIGIN: &str = "*";

/// A message as seen by the receiving context.
#[derive(Debug, Clone, PartialEq)]
pub struct PortMessage {
    pub origin: String,
    pub data: Value,
}

/// Sending half of one port end. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
    origin: String,
    peer_origin: String,
    tx: mpsc::UnboundedSender<PortMessage>,
}

impl PortSender {
    /// Posts `data` to the peer if `target_origin` matches it (or is `*`).
    pub fn post(&self, data: Value, target_origin: &str) -> IpcResult<()> {
        if target_origin != ANY_ORIGIN && target_origin != self.peer_origin {
            return Err(IpcError::OriginMismatch {
                target: target_origin.to_string(),
                peer: self.peer_origin.clone(),
            });
        }
        self.tx
            .send(PortMessage {
                origin: self.origin.clone(),
                data,
            })
            .map_err(|_| IpcError::PortClosed)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn peer_origin(&self) -> &str {
        &self.peer_origin
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a port pair.
#[derive(Debug)]
pub struct PortEnd {
    pub sender: PortSender,
    pub receiver: mpsc::UnboundedReceiver<PortMessage>,
}

impl PortEnd {
    pub fn origin(&self) -> &str {
        self.sender.origin()
    }
}

/// Creates a connected pair of ends for contexts at `a_origin` and `b_origin`.
pub fn channel(a_origin: &str, b_origin: &str) -> (PortEnd, PortEnd) {
    let (to_b, b_rx) = mpsc::unbounded_channel();
    let (to_a, a_rx) = mpsc::unbounded_channel();
    let a = PortEnd {
        sender: PortSender {
            origin: a_origin.to_string(),
            peer_origin: b_origin.to_string(),
            tx: to_b,
        },
        receiver: a_rx,
    };
    let b = PortEnd {
        sender: PortSender {
            origin: b_origin.to_string(),
            peer_origin: a_origin.to_string(),
            tx: to_a,
        },
        receiver: b_rx,
    };
    (a, b)
}
