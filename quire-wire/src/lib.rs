use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use quire_core::{
    annotation_marker_id, Locator, NavError, RectPayload, RendererBridge, Result, RgbColor,
    SelectionInfo,
};

/// One renderer call on the wire: a correlation id plus the operation
/// payload, flattened into a single JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: BridgeOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BridgeOp {
    GetCurrentSelection,
    CreateHighlight {
        locator: Locator,
        color: RgbColor,
    },
    DestroyHighlight {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateAnnotationMarker {
        highlight_id: String,
    },
    GetHighlightRect {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: u64,
    #[serde(flatten)]
    pub reply: BridgeReply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum BridgeReply {
    Selection {
        #[serde(skip_serializing_if = "Option::is_none")]
        selection: Option<SelectionInfo>,
    },
    HighlightCreated {
        id: String,
    },
    Ack,
    Rect {
        #[serde(skip_serializing_if = "Option::is_none")]
        rect: Option<RectPayload>,
    },
    Error {
        kind: WireErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireErrorKind {
    UnknownHighlight,
    ResourceNotLoaded,
    Internal,
}

fn reply_error(kind: WireErrorKind, message: String, subject: Option<&str>) -> NavError {
    match kind {
        WireErrorKind::UnknownHighlight => NavError::UnknownHighlight {
            id: subject.unwrap_or_default().to_string(),
        },
        WireErrorKind::ResourceNotLoaded | WireErrorKind::Internal => NavError::Protocol(message),
    }
}

/// `RendererBridge` over an embedder-owned message channel. Requests go out
/// on an `mpsc` queue in issue order; the embedder feeds renderer responses
/// back through [`WireBridge::complete`], correlated by request id. Each
/// call resolves exactly once, on the task that awaits it, never before the
/// initiating call has returned.
pub struct WireBridge {
    outbound: mpsc::Sender<BridgeRequest>,
    pending: Mutex<Option<HashMap<u64, oneshot::Sender<BridgeReply>>>>,
    next_id: AtomicU64,
}

impl WireBridge {
    /// Returns the bridge and the receiving end the embedder drains to
    /// forward requests into the renderer.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<BridgeRequest>) {
        let (outbound, inbound) = mpsc::channel(capacity);
        let bridge = Arc::new(Self {
            outbound,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(0),
        });
        (bridge, inbound)
    }

    /// Deliver a renderer response. Responses for ids that are no longer
    /// pending (late, duplicate, or flushed by a disconnect) are dropped.
    pub fn complete(&self, response: BridgeResponse) {
        let waiter = match self.pending.lock().as_mut() {
            Some(pending) => pending.remove(&response.id),
            None => None,
        };
        match waiter {
            Some(tx) => {
                if tx.send(response.reply).is_err() {
                    debug!(id = response.id, "caller gave up before the reply arrived");
                }
            }
            None => warn!(id = response.id, "dropping response for unknown request"),
        }
    }

    /// Flush every pending call with `BridgeLost` and refuse new ones. Call
    /// this once the embedder detects the renderer went away.
    pub fn connection_lost(&self) {
        let pending = self.pending.lock().take();
        if let Some(pending) = pending {
            // Dropping the senders resolves every waiting call.
            debug!(flushed = pending.len(), "renderer bridge lost");
        }
    }

    pub fn is_lost(&self) -> bool {
        self.pending.lock().is_none()
    }

    async fn call(&self, op: BridgeOp) -> Result<BridgeReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let Some(pending) = pending.as_mut() else {
                return Err(NavError::BridgeLost);
            };
            pending.insert(id, tx);
        }

        if self
            .outbound
            .send(BridgeRequest { id, op })
            .await
            .is_err()
        {
            if let Some(pending) = self.pending.lock().as_mut() {
                pending.remove(&id);
            }
            return Err(NavError::BridgeLost);
        }

        rx.await.map_err(|_| NavError::BridgeLost)
    }
}

#[async_trait]
impl RendererBridge for WireBridge {
    async fn current_selection(&self) -> Result<Option<SelectionInfo>> {
        match self.call(BridgeOp::GetCurrentSelection).await? {
            BridgeReply::Selection { selection } => Ok(selection),
            BridgeReply::Error { kind, message } => Err(reply_error(kind, message, None)),
            other => Err(NavError::Protocol(format!(
                "unexpected selection reply: {other:?}"
            ))),
        }
    }

    async fn create_highlight(&self, locator: &Locator, color: RgbColor) -> Result<String> {
        let op = BridgeOp::CreateHighlight {
            locator: locator.clone(),
            color,
        };
        match self.call(op).await? {
            BridgeReply::HighlightCreated { id } => Ok(id),
            BridgeReply::Error { kind, message } => Err(reply_error(kind, message, None)),
            other => Err(NavError::Protocol(format!(
                "unexpected create reply: {other:?}"
            ))),
        }
    }

    async fn destroy_highlight(&self, id: &str) -> Result<()> {
        let op = BridgeOp::DestroyHighlight { id: id.to_string() };
        match self.call(op).await? {
            BridgeReply::Ack => Ok(()),
            BridgeReply::Error { kind, message } => Err(reply_error(kind, message, Some(id))),
            other => Err(NavError::Protocol(format!(
                "unexpected destroy reply: {other:?}"
            ))),
        }
    }

    async fn create_annotation_marker(&self, highlight_id: &str) -> Result<()> {
        let op = BridgeOp::CreateAnnotationMarker {
            highlight_id: highlight_id.to_string(),
        };
        match self.call(op).await? {
            BridgeReply::Ack => Ok(()),
            BridgeReply::Error { kind, message } => {
                Err(reply_error(kind, message, Some(highlight_id)))
            }
            other => Err(NavError::Protocol(format!(
                "unexpected marker reply: {other:?}"
            ))),
        }
    }

    async fn highlight_rect(&self, id: &str) -> Result<Option<RectPayload>> {
        let op = BridgeOp::GetHighlightRect { id: id.to_string() };
        match self.call(op).await? {
            BridgeReply::Rect { rect } => Ok(rect),
            BridgeReply::Error { kind, message } => Err(reply_error(kind, message, Some(id))),
            other => Err(NavError::Protocol(format!(
                "unexpected rect reply: {other:?}"
            ))),
        }
    }
}

static OVERLAY_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f2d9ab4-1c87-5e6f-92d0-7a41c8b0e5d9").expect("valid namespace UUID")
});

/// In-process renderer double for tests and demos. Overlay ids are
/// deterministic (`HIGHLIGHT-<uuid5>` over a per-renderer counter) and every
/// handled operation is journalled in arrival order.
pub struct ScriptedRenderer {
    selection: Mutex<Option<SelectionInfo>>,
    rect: Mutex<Option<RectPayload>>,
    live: Mutex<HashSet<String>>,
    journal: Mutex<Vec<String>>,
    loaded: Mutex<bool>,
    counter: AtomicU64,
}

impl Default for ScriptedRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self {
            selection: Mutex::new(None),
            rect: Mutex::new(None),
            live: Mutex::new(HashSet::new()),
            journal: Mutex::new(Vec::new()),
            loaded: Mutex::new(true),
            counter: AtomicU64::new(0),
        }
    }

    pub fn set_selection(&self, selection: Option<SelectionInfo>) {
        *self.selection.lock() = selection;
    }

    pub fn set_rect(&self, rect: Option<RectPayload>) {
        *self.rect.lock() = rect;
    }

    /// Scripted "is the target resource rendered" switch; when false,
    /// highlight creation fails the way a real renderer would.
    pub fn set_loaded(&self, loaded: bool) {
        *self.loaded.lock() = loaded;
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn live_overlays(&self) -> Vec<String> {
        let mut overlays: Vec<String> = self.live.lock().iter().cloned().collect();
        overlays.sort();
        overlays
    }

    fn next_overlay_id(&self) -> String {
        let ordinal = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let uuid = Uuid::new_v5(&OVERLAY_NAMESPACE, &ordinal.to_be_bytes());
        format!("HIGHLIGHT-{uuid}")
    }

    pub fn handle(&self, op: &BridgeOp) -> BridgeReply {
        match op {
            BridgeOp::GetCurrentSelection => {
                self.journal.lock().push("getCurrentSelection".to_string());
                BridgeReply::Selection {
                    selection: self.selection.lock().clone(),
                }
            }
            BridgeOp::CreateHighlight { .. } => {
                if !*self.loaded.lock() {
                    self.journal.lock().push("createHighlight !".to_string());
                    return BridgeReply::Error {
                        kind: WireErrorKind::ResourceNotLoaded,
                        message: "resource is not rendered".to_string(),
                    };
                }
                let id = self.next_overlay_id();
                self.live.lock().insert(id.clone());
                self.journal.lock().push(format!("createHighlight {id}"));
                BridgeReply::HighlightCreated { id }
            }
            BridgeOp::DestroyHighlight { id } => {
                self.live.lock().remove(id);
                self.journal.lock().push(format!("destroyHighlight {id}"));
                BridgeReply::Ack
            }
            BridgeOp::CreateAnnotationMarker { highlight_id } => {
                if !self.live.lock().contains(highlight_id) {
                    return BridgeReply::Error {
                        kind: WireErrorKind::UnknownHighlight,
                        message: format!("no such highlight {highlight_id}"),
                    };
                }
                let marker = annotation_marker_id(highlight_id);
                self.live.lock().insert(marker);
                self.journal
                    .lock()
                    .push(format!("createAnnotationMarker {highlight_id}"));
                BridgeReply::Ack
            }
            BridgeOp::GetHighlightRect { id } => {
                self.journal.lock().push(format!("getHighlightRect {id}"));
                if !self.live.lock().contains(id) {
                    return BridgeReply::Rect { rect: None };
                }
                BridgeReply::Rect {
                    rect: *self.rect.lock(),
                }
            }
        }
    }

    /// Drain requests and answer them until the request channel closes.
    /// Spawn this next to a [`WireBridge`] to get a working loopback pair.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<BridgeRequest>,
        bridge: Arc<WireBridge>,
    ) {
        while let Some(request) = inbound.recv().await {
            let reply = self.handle(&request.op);
            bridge.complete(BridgeResponse {
                id: request.id,
                reply,
            });
        }
    }
}
