use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NavError>;

/// Error taxonomy shared by the navigator and the highlight manager. None of
/// these are fatal to the reading session; callers recover per operation.
#[derive(Debug, Error)]
pub enum NavError {
    #[error("no resource with href {href:?} in the reading order")]
    UnresolvableLocator { href: String },

    #[error("no active text selection")]
    NoSelection,

    #[error("unknown highlight id {id:?}")]
    UnknownHighlight { id: String },

    #[error("renderer bridge lost")]
    BridgeLost,

    #[error("malformed bridge payload: {0}")]
    Protocol(String),

    #[error("failed to load resource {index}: {reason}")]
    Load { index: usize, reason: String },
}

/// An addressable position inside a publication: a resource plus an optional
/// in-resource location and optional surrounding text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Locations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<LocatorText>,
}

impl Locator {
    pub fn from_link(link: &Link) -> Self {
        Self {
            href: link.href.clone(),
            media_type: link.media_type.clone(),
            locations: None,
            text: None,
        }
    }

    pub fn with_locations(mut self, locations: Locations) -> Self {
        self.locations = Some(locations);
        self
    }
}

/// Structured in-resource position. Every field is optional on the wire;
/// absence means "not provided", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Locations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progression: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    #[serde(rename = "startOffset", skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
    #[serde(rename = "endOffset", skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<usize>,
}

impl Locations {
    pub fn top_of_resource() -> Self {
        Self {
            progression: Some(0.0),
            ..Self::default()
        }
    }

    pub fn end_of_resource() -> Self {
        Self {
            progression: Some(1.0),
            ..Self::default()
        }
    }

    pub fn at_progression(progression: f64) -> Self {
        Self {
            progression: Some(progression),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocatorText {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingProgression {
    Ltr,
    Rtl,
}

impl Default for ReadingProgression {
    fn default() -> Self {
        ReadingProgression::Ltr
    }
}

/// One entry of the publication's ordered resource list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

impl Link {
    pub fn new(href: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: media_type.into(),
        }
    }
}

/// The publication as the navigator sees it: an identifier, the ordered
/// reading order, and the session-fixed reading progression. Immutable for
/// the lifetime of a reading session; shared via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub identifier: String,
    #[serde(rename = "readingOrder")]
    pub reading_order: Vec<Link>,
    #[serde(rename = "readingProgression", default)]
    pub reading_progression: ReadingProgression,
}

impl Publication {
    pub fn new(identifier: impl Into<String>, reading_order: Vec<Link>) -> Self {
        Self {
            identifier: identifier.into(),
            reading_order,
            reading_progression: ReadingProgression::Ltr,
        }
    }

    pub fn with_progression(mut self, progression: ReadingProgression) -> Self {
        self.reading_progression = progression;
        self
    }

    pub fn resource_count(&self) -> usize {
        self.reading_order.len()
    }

    pub fn link_at(&self, index: usize) -> Option<&Link> {
        self.reading_order.get(index)
    }
}

/// A locator resolved against the reading order: the resource ordinal plus
/// the in-resource target the renderer should settle on.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub index: usize,
    pub locations: Locations,
}

/// Maps resource hrefs to their ordinal in the reading order. Built once per
/// publication; pure lookups, no I/O.
#[derive(Debug, Clone)]
pub struct PositionIndex {
    by_href: HashMap<String, usize>,
    count: usize,
}

impl PositionIndex {
    pub fn new(publication: &Publication) -> Self {
        let by_href = publication
            .reading_order
            .iter()
            .enumerate()
            .map(|(index, link)| (link.href.clone(), index))
            .collect();
        Self {
            by_href,
            count: publication.reading_order.len(),
        }
    }

    pub fn resource_count(&self) -> usize {
        self.count
    }

    pub fn index_of(&self, href: &str) -> Result<usize> {
        self.by_href
            .get(href)
            .copied()
            .ok_or_else(|| NavError::UnresolvableLocator {
                href: href.to_string(),
            })
    }

    /// A locator without locations resolves to the top of its resource; an
    /// unknown href is an error, never resource 0.
    pub fn resolve(&self, locator: &Locator) -> Result<ResolvedTarget> {
        let index = self.index_of(&locator.href)?;
        let locations = locator
            .locations
            .clone()
            .unwrap_or_else(Locations::top_of_resource);
        Ok(ResolvedTarget { index, locations })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RgbColor {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Colour used when an annotation is created without an explicit highlight.
pub const DEFAULT_ANNOTATION_COLOR: RgbColor = RgbColor::new(150, 150, 150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightStyle {
    Highlight,
    Underline,
}

/// A visual overlay record. The id is issued by the renderer on creation and
/// the record is immutable afterwards; restyling is destroy-and-recreate.
#[derive(Debug, Clone, PartialEq)]
pub struct Highlight {
    pub id: String,
    pub locator: Locator,
    pub color: RgbColor,
    pub style: HighlightStyle,
}

/// The note marker attached to a highlight shares its id with the
/// `HIGHLIGHT` substring swapped for `ANNOTATION`.
pub fn annotation_marker_id(highlight_id: &str) -> String {
    highlight_id.replace("HIGHLIGHT", "ANNOTATION")
}

/// Rectangle as the renderer reports it, in the bridge's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectPayload {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Resolved on-screen rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// What the renderer reports for the active text selection. The resource
/// href is not part of it; the caller combines this with the currently
/// rendered resource to mint a full locator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Locations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<LocatorText>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

/// Asynchronous request/response channel to the embedded renderer. Every
/// call completes exactly once and never resolves synchronously before the
/// initiating call returns, so callers may set up state after issuing it.
#[async_trait]
pub trait RendererBridge: Send + Sync {
    /// `Ok(None)` when no text is selected.
    async fn current_selection(&self) -> Result<Option<SelectionInfo>>;

    /// Returns the renderer-issued highlight id. Fails if the locator's
    /// resource is not currently rendered.
    async fn create_highlight(&self, locator: &Locator, color: RgbColor) -> Result<String>;

    /// Idempotent: destroying a nonexistent id is not an error.
    async fn destroy_highlight(&self, id: &str) -> Result<()>;

    /// Fails with `UnknownHighlight` if the renderer does not know the id.
    async fn create_annotation_marker(&self, highlight_id: &str) -> Result<()>;

    /// `Ok(None)` when the id is unknown to the renderer or off-screen.
    async fn highlight_rect(&self, id: &str) -> Result<Option<RectPayload>>;
}

/// Handle onto one loaded resource's rendering surface. Obtained from
/// `ResourceHost::load` and replaced wholesale on the next load; a holder of
/// a stale handle talks to a surface that is no longer on screen.
#[async_trait]
pub trait ResourceSession: Send + Sync {
    async fn scroll_to(&self, locations: &Locations) -> Result<()>;

    /// Step the renderer's internal sub-position (page within the resource).
    /// `Some(progression)` after a move, `None` at the resource's edge.
    async fn step(&self, direction: StepDirection) -> Result<Option<f64>>;
}

/// The resource-loading collaborator. Loading tears down whatever surface
/// was active before.
#[async_trait]
pub trait ResourceHost: Send + Sync {
    async fn load(&self, index: usize) -> Result<Arc<dyn ResourceSession>>;
}

/// Snapshot-readable view of the navigator's current resource index. The
/// navigator is the only writer; it clears the handle while a load is in
/// flight, so readers observe `None` exactly while no surface is active.
#[derive(Debug, Clone, Default)]
pub struct PositionHandle {
    inner: Arc<Mutex<Option<usize>>>,
}

impl PositionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, index: usize) {
        *self.inner.lock() = Some(index);
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    pub fn snapshot(&self) -> Option<usize> {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication() -> Publication {
        Publication::new(
            "urn:quire:test",
            vec![
                Link::new("/chapter1.xhtml", "application/xhtml+xml"),
                Link::new("/chapter2.xhtml", "application/xhtml+xml"),
                Link::new("/chapter3.xhtml", "application/xhtml+xml"),
            ],
        )
    }

    #[test]
    fn resolve_is_deterministic() {
        let index = PositionIndex::new(&publication());
        let locator = Locator {
            href: "/chapter2.xhtml".to_string(),
            media_type: "application/xhtml+xml".to_string(),
            locations: Some(Locations::at_progression(0.4)),
            text: None,
        };

        let first = index.resolve(&locator).unwrap();
        let second = index.resolve(&locator).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.index, 1);
        assert_eq!(first.locations.progression, Some(0.4));
    }

    #[test]
    fn resolve_without_locations_targets_top_of_resource() {
        let index = PositionIndex::new(&publication());
        let locator = Locator::from_link(&Link::new("/chapter3.xhtml", "application/xhtml+xml"));

        let resolved = index.resolve(&locator).unwrap();
        assert_eq!(resolved.index, 2);
        assert_eq!(resolved.locations.progression, Some(0.0));
        assert!(resolved.locations.selector.is_none());
    }

    #[test]
    fn unknown_href_is_an_error_not_resource_zero() {
        let index = PositionIndex::new(&publication());
        let locator = Locator::from_link(&Link::new("/missing.xhtml", "application/xhtml+xml"));

        match index.resolve(&locator) {
            Err(NavError::UnresolvableLocator { href }) => assert_eq!(href, "/missing.xhtml"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn annotation_marker_id_swaps_the_prefix() {
        assert_eq!(
            annotation_marker_id("HIGHLIGHT-1234"),
            "ANNOTATION-1234".to_string()
        );
        // Ids without the marker substring pass through unchanged.
        assert_eq!(annotation_marker_id("overlay-9"), "overlay-9");
    }

    #[test]
    fn locator_json_omits_absent_fields() {
        let locator = Locator::from_link(&Link::new("/chapter1.xhtml", "application/xhtml+xml"));
        let json = serde_json::to_value(&locator).unwrap();

        assert_eq!(json["href"], "/chapter1.xhtml");
        assert_eq!(json["type"], "application/xhtml+xml");
        assert!(json.get("locations").is_none());
        assert!(json.get("text").is_none());
    }

    #[test]
    fn absent_wire_fields_deserialize_to_none() {
        let locator: Locator = serde_json::from_str(
            r#"{"href":"/chapter1.xhtml","type":"application/xhtml+xml","locations":{"progression":0.25}}"#,
        )
        .unwrap();

        let locations = locator.locations.unwrap();
        assert_eq!(locations.progression, Some(0.25));
        assert_eq!(locations.selector, None);
        assert_eq!(locations.start_offset, None);
        assert!(locator.text.is_none());
    }

    #[test]
    fn selection_round_trips_with_offsets() {
        let selection = SelectionInfo {
            locations: Some(Locations {
                progression: Some(0.5),
                selector: Some("/html/body/p[3]".to_string()),
                fragment: None,
                start_offset: Some(12),
                end_offset: Some(48),
            }),
            text: Some(LocatorText {
                before: Some("the ".to_string()),
                highlight: Some("quick brown fox".to_string()),
                after: Some(" jumps".to_string()),
            }),
        };

        let json = serde_json::to_string(&selection).unwrap();
        assert!(json.contains("startOffset"));
        let back: SelectionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, selection);
    }

    #[test]
    fn position_handle_snapshots_are_independent() {
        let handle = PositionHandle::new();
        assert_eq!(handle.snapshot(), None);

        handle.set(2);
        let reader = handle.clone();
        assert_eq!(reader.snapshot(), Some(2));

        handle.clear();
        assert_eq!(reader.snapshot(), None);
    }
}
