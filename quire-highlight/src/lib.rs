use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{instrument, warn};

use quire_core::{
    annotation_marker_id, Highlight, HighlightStyle, Locator, NavError, PositionHandle,
    Publication, Rect, RectPayload, RendererBridge, Result, RgbColor, SelectionInfo,
    DEFAULT_ANNOTATION_COLOR,
};

/// Owns the authoritative set of highlight records for a reading session and
/// translates local operations into ordered renderer round-trips.
///
/// The renderer is the source of truth for id allocation: no record exists
/// locally until a create round-trip has returned its id. Composed
/// operations (`create_highlight`, `create_annotation`) queue behind a fair
/// gate, so a second call issued before the first settles runs after it
/// rather than interleaving with it.
///
/// No timeouts are imposed: a round-trip the renderer never answers leaves
/// its operation pending (callers may wrap calls with their own deadline)
/// until [`HighlightManager::on_bridge_lost`] flushes it.
pub struct HighlightManager {
    bridge: Arc<dyn RendererBridge>,
    publication: Arc<Publication>,
    position: PositionHandle,
    density: f64,
    records: Mutex<HashMap<String, Highlight>>,
    gate: tokio::sync::Mutex<()>,
    lost: watch::Sender<bool>,
}

impl HighlightManager {
    /// `position` is the navigator's handle; `density` is the device pixel
    /// density applied when resolving highlight rectangles.
    pub fn new(
        bridge: Arc<dyn RendererBridge>,
        publication: Arc<Publication>,
        position: PositionHandle,
        density: f64,
    ) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            bridge,
            publication,
            position,
            density,
            records: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
            lost,
        }
    }

    /// Highlight the renderer's current selection. Fails with `NoSelection`
    /// when nothing is selected, or when the selection vanished because the
    /// current resource changed under the gesture; no record is created in
    /// either case.
    #[instrument(skip(self))]
    pub async fn create_highlight(&self, color: RgbColor) -> Result<Highlight> {
        let _gate = self.gate.lock().await;
        self.create_highlight_inner(color, HighlightStyle::Highlight)
            .await
    }

    /// Attach a note marker to `existing`, or to a freshly created highlight
    /// in the default annotation colour when none is supplied. The selection
    /// round-trip always precedes the marker round-trip; a failure in either
    /// step short-circuits the rest.
    #[instrument(skip(self, existing))]
    pub async fn create_annotation(&self, existing: Option<Highlight>) -> Result<Highlight> {
        let _gate = self.gate.lock().await;
        let highlight = match existing {
            Some(highlight) => highlight,
            None => {
                self.create_highlight_inner(DEFAULT_ANNOTATION_COLOR, HighlightStyle::Highlight)
                    .await?
            }
        };
        self.with_bridge(self.bridge.create_annotation_marker(&highlight.id))
            .await?;
        Ok(highlight)
    }

    /// Remove a highlight and its note marker. Idempotent: hiding an id that
    /// was never created, or hiding twice, is not an error. The local record
    /// is dropped regardless of whether the renderer acknowledges; overlay
    /// destruction cannot meaningfully fail from the caller's perspective.
    #[instrument(skip(self))]
    pub async fn hide(&self, id: &str) {
        self.records.lock().remove(id);

        if let Err(err) = self.with_bridge(self.bridge.destroy_highlight(id)).await {
            warn!(%id, %err, "failed to destroy highlight overlay");
        }
        let marker = annotation_marker_id(id);
        if let Err(err) = self.with_bridge(self.bridge.destroy_highlight(&marker)).await {
            warn!(id = %marker, %err, "failed to destroy annotation marker overlay");
        }
    }

    /// Resolve a highlight's on-screen rectangle. `Ok(None)` when the
    /// highlight is currently off-screen; `UnknownHighlight` when the id is
    /// not in the local record set.
    pub async fn rect_for(&self, id: &str) -> Result<Option<Rect>> {
        if !self.records.lock().contains_key(id) {
            return Err(NavError::UnknownHighlight { id: id.to_string() });
        }
        let payload = self.with_bridge(self.bridge.highlight_rect(id)).await?;
        Ok(payload.map(|payload| self.resolve_rect(payload)))
    }

    /// Signal that the renderer bridge became unavailable. Every pending
    /// bridge round-trip resolves `Err(BridgeLost)` and subsequent calls
    /// fail fast until the manager is rebuilt against a fresh bridge.
    pub fn on_bridge_lost(&self) {
        self.lost.send_replace(true);
    }

    pub fn get(&self, id: &str) -> Option<Highlight> {
        self.records.lock().get(id).cloned()
    }

    pub fn highlights(&self) -> Vec<Highlight> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    async fn create_highlight_inner(
        &self,
        color: RgbColor,
        style: HighlightStyle,
    ) -> Result<Highlight> {
        let selection = self
            .with_bridge(self.bridge.current_selection())
            .await?
            .ok_or(NavError::NoSelection)?;
        let locator = self.selection_locator(selection)?;

        let id = self
            .with_bridge(self.bridge.create_highlight(&locator, color))
            .await?;
        let highlight = Highlight {
            id: id.clone(),
            locator,
            color,
            style,
        };
        self.records.lock().insert(id, highlight.clone());
        Ok(highlight)
    }

    /// Mint the full locator for a selection: the renderer only reports
    /// in-resource locations and text, the href comes from the resource
    /// currently on screen.
    fn selection_locator(&self, selection: SelectionInfo) -> Result<Locator> {
        let index = self.position.snapshot().ok_or(NavError::NoSelection)?;
        let link = self
            .publication
            .link_at(index)
            .ok_or(NavError::NoSelection)?;
        Ok(Locator {
            href: link.href.clone(),
            media_type: link.media_type.clone(),
            locations: selection.locations,
            text: selection.text,
        })
    }

    fn resolve_rect(&self, payload: RectPayload) -> Rect {
        // top/height arrive in the renderer's CSS pixels and need the
        // density factor; left/width already come back in device pixels.
        let top = payload.top * self.density;
        let height = payload.height * self.density;
        Rect {
            left: payload.left,
            top,
            right: payload.left + payload.width,
            bottom: top + height,
        }
    }

    /// Race a bridge round-trip against the bridge-lost flag.
    async fn with_bridge<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if *self.lost.borrow() {
            return Err(NavError::BridgeLost);
        }
        let mut lost = self.lost.subscribe();
        tokio::select! {
            result = call => result,
            _ = lost.wait_for(|lost| *lost) => Err(NavError::BridgeLost),
        }
    }
}
