use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, instrument};

use quire_core::{
    Link, Locations, Locator, NavError, PositionHandle, PositionIndex, Publication,
    ReadingProgression, ResourceHost, ResourceSession, Result, StepDirection,
};

enum NavState {
    Idle,
    Loading {
        target: usize,
        pending: Locator,
    },
    Ready {
        index: usize,
        locator: Locator,
        session: Arc<dyn ResourceSession>,
    },
}

/// Drives the current reading position: resolves locators against the
/// reading order, loads resources through the host, and publishes the
/// settled position on a watch stream.
///
/// A `go_to` future resolves once the in-resource scroll has settled, not
/// when the load was merely accepted. A `go_to` issued while another is in
/// flight supersedes it: the earlier call completes `Ok(false)` and never
/// reaches the stream.
///
/// No timeout is imposed on the host: a load that never completes parks the
/// navigator in its loading state until a later navigation supersedes it.
pub struct Navigator {
    publication: Arc<Publication>,
    index: PositionIndex,
    host: Arc<dyn ResourceHost>,
    state: Mutex<NavState>,
    generation: AtomicU64,
    position: PositionHandle,
    locator_tx: watch::Sender<Option<Locator>>,
}

impl Navigator {
    pub fn new(publication: Arc<Publication>, host: Arc<dyn ResourceHost>) -> Self {
        let index = PositionIndex::new(&publication);
        let (locator_tx, _) = watch::channel(None);
        Self {
            publication,
            index,
            host,
            state: Mutex::new(NavState::Idle),
            generation: AtomicU64::new(0),
            position: PositionHandle::new(),
            locator_tx,
        }
    }

    /// Stream of settled positions. At most one pending value: a reader that
    /// lags only ever observes the latest settled locator.
    pub fn locator_stream(&self) -> watch::Receiver<Option<Locator>> {
        self.locator_tx.subscribe()
    }

    /// Shared read handle onto the current resource index; cleared while a
    /// load is in flight.
    pub fn position_handle(&self) -> PositionHandle {
        self.position.clone()
    }

    pub fn current_index(&self) -> Option<usize> {
        match &*self.state.lock() {
            NavState::Ready { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn current_locator(&self) -> Option<Locator> {
        match &*self.state.lock() {
            NavState::Ready { locator, .. } => Some(locator.clone()),
            _ => None,
        }
    }

    /// The resource index an in-flight navigation is headed for, if any.
    pub fn loading_target(&self) -> Option<usize> {
        match &*self.state.lock() {
            NavState::Loading { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// The locator an in-flight navigation will settle on, if any.
    pub fn pending_locator(&self) -> Option<Locator> {
        match &*self.state.lock() {
            NavState::Loading { pending, .. } => Some(pending.clone()),
            _ => None,
        }
    }

    /// Navigate to a locator. `Err(UnresolvableLocator)` when the href is
    /// not in the reading order (and nothing changes); `Ok(false)` when a
    /// newer navigation superseded this one before it settled.
    #[instrument(skip(self, locator), fields(href = %locator.href))]
    pub async fn go_to(&self, locator: Locator) -> Result<bool> {
        let target = self.index.resolve(&locator)?;
        let (generation, same_resource) = self.begin(target.index, &locator);

        match same_resource {
            Some(session) => {
                if let Err(err) = session.scroll_to(&target.locations).await {
                    if !self.stale(generation) {
                        self.commit(generation, target.index, locator, session);
                    }
                    return Err(err);
                }
                Ok(self.commit(generation, target.index, locator, session))
            }
            None => {
                self.enter_resource(generation, target.index, locator, target.locations)
                    .await
            }
        }
    }

    pub async fn go_to_link(&self, link: &Link) -> Result<bool> {
        self.go_to(Locator::from_link(link)).await
    }

    /// Step to the next sub-position, crossing into the next resource at the
    /// edge. `Ok(false)` at the outer edge of the last resource.
    pub async fn go_forward(&self) -> Result<bool> {
        self.step_resource(StepDirection::Forward).await
    }

    /// Step to the previous sub-position, entering the previous resource at
    /// its end. `Ok(false)` at the outer edge of the first resource.
    pub async fn go_backward(&self) -> Result<bool> {
        self.step_resource(StepDirection::Backward).await
    }

    /// Physical-direction steps: the single place reading progression maps
    /// gestures onto logical forward/backward.
    pub async fn go_left(&self) -> Result<bool> {
        match self.publication.reading_progression {
            ReadingProgression::Ltr => self.go_backward().await,
            ReadingProgression::Rtl => self.go_forward().await,
        }
    }

    pub async fn go_right(&self) -> Result<bool> {
        match self.publication.reading_progression {
            ReadingProgression::Ltr => self.go_forward().await,
            ReadingProgression::Rtl => self.go_backward().await,
        }
    }

    async fn step_resource(&self, direction: StepDirection) -> Result<bool> {
        let (generation, index, session) = {
            let state = self.state.lock();
            match &*state {
                NavState::Ready { index, session, .. } => (
                    self.generation.load(Ordering::SeqCst),
                    *index,
                    Arc::clone(session),
                ),
                // No surface to step while idle or loading.
                _ => return Ok(false),
            }
        };

        if let Some(progression) = session.step(direction).await? {
            return Ok(self.settle_sub_position(generation, index, progression));
        }

        let adjacent = match direction {
            StepDirection::Forward => {
                let next = index + 1;
                (next < self.index.resource_count()).then_some(next)
            }
            StepDirection::Backward => index.checked_sub(1),
        };
        let Some(next) = adjacent else {
            debug!(index, ?direction, "at the publication edge");
            return Ok(false);
        };

        let entry = match direction {
            StepDirection::Forward => Locations::top_of_resource(),
            StepDirection::Backward => Locations::end_of_resource(),
        };
        let link = self
            .publication
            .link_at(next)
            .ok_or(NavError::UnresolvableLocator {
                href: format!("#{next}"),
            })?;
        let locator = Locator::from_link(link).with_locations(entry.clone());

        let (generation, _) = self.begin(next, &locator);
        self.enter_resource(generation, next, locator, entry).await
    }

    /// Load `index`, scroll to the entry target, then commit and emit if
    /// this operation is still the latest one.
    async fn enter_resource(
        &self,
        generation: u64,
        index: usize,
        locator: Locator,
        target: Locations,
    ) -> Result<bool> {
        let session = match self.host.load(index).await {
            Ok(session) => session,
            Err(err) => {
                self.abort(generation);
                return Err(err);
            }
        };
        if self.stale(generation) {
            return Ok(false);
        }

        if let Err(err) = session.scroll_to(&target).await {
            // The resource did load; settle on it even though the scroll
            // failed, so the session is not left parked in Loading.
            if !self.stale(generation) {
                self.commit(generation, index, locator, session);
            }
            return Err(err);
        }

        Ok(self.commit(generation, index, locator, session))
    }

    /// Start a navigation: bump the generation and, unless the target is the
    /// already-loaded resource, transition to Loading and invalidate the
    /// position handle.
    fn begin(&self, target: usize, pending: &Locator) -> (u64, Option<Arc<dyn ResourceSession>>) {
        let mut state = self.state.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match &*state {
            NavState::Ready { index, session, .. } if *index == target => {
                (generation, Some(Arc::clone(session)))
            }
            _ => {
                *state = NavState::Loading {
                    target,
                    pending: pending.clone(),
                };
                self.position.clear();
                (generation, None)
            }
        }
    }

    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn commit(
        &self,
        generation: u64,
        index: usize,
        locator: Locator,
        session: Arc<dyn ResourceSession>,
    ) -> bool {
        let mut state = self.state.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.position.set(index);
        *state = NavState::Ready {
            index,
            locator: locator.clone(),
            session,
        };
        self.locator_tx.send_replace(Some(locator));
        true
    }

    fn settle_sub_position(&self, generation: u64, index: usize, progression: f64) -> bool {
        let mut state = self.state.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        let NavState::Ready {
            index: current,
            locator,
            ..
        } = &mut *state
        else {
            return false;
        };
        if *current != index {
            return false;
        }
        locator.locations = Some(Locations::at_progression(progression));
        let settled = locator.clone();
        self.locator_tx.send_replace(Some(settled));
        true
    }

    fn abort(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *state = NavState::Idle;
        self.position.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    struct FakeSession {
        page_count: usize,
        page: Mutex<usize>,
        scrolled_to: Mutex<Vec<Locations>>,
    }

    impl FakeSession {
        fn new(page_count: usize) -> Self {
            Self {
                page_count,
                page: Mutex::new(0),
                scrolled_to: Mutex::new(Vec::new()),
            }
        }

        fn progression(&self, page: usize) -> f64 {
            page as f64 / self.page_count.saturating_sub(1).max(1) as f64
        }
    }

    #[async_trait]
    impl ResourceSession for FakeSession {
        async fn scroll_to(&self, locations: &Locations) -> Result<()> {
            if locations.progression == Some(1.0) {
                *self.page.lock() = self.page_count - 1;
            } else {
                *self.page.lock() = 0;
            }
            self.scrolled_to.lock().push(locations.clone());
            Ok(())
        }

        async fn step(&self, direction: StepDirection) -> Result<Option<f64>> {
            let mut page = self.page.lock();
            match direction {
                StepDirection::Forward if *page + 1 < self.page_count => {
                    *page += 1;
                    Ok(Some(self.progression(*page)))
                }
                StepDirection::Backward if *page > 0 => {
                    *page -= 1;
                    Ok(Some(self.progression(*page)))
                }
                _ => Ok(None),
            }
        }
    }

    struct FakeHost {
        page_count: usize,
        loaded: Mutex<Vec<usize>>,
        sessions: Mutex<HashMap<usize, Arc<FakeSession>>>,
        // Loads of this index park until `release` is notified.
        hold_index: Option<usize>,
        load_started: Notify,
        release: Notify,
    }

    impl FakeHost {
        fn new(page_count: usize) -> Self {
            Self {
                page_count,
                loaded: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                hold_index: None,
                load_started: Notify::new(),
                release: Notify::new(),
            }
        }

        fn holding(page_count: usize, hold_index: usize) -> Self {
            Self {
                hold_index: Some(hold_index),
                ..Self::new(page_count)
            }
        }

        fn session(&self, index: usize) -> Option<Arc<FakeSession>> {
            self.sessions.lock().get(&index).cloned()
        }
    }

    #[async_trait]
    impl ResourceHost for FakeHost {
        async fn load(&self, index: usize) -> Result<Arc<dyn ResourceSession>> {
            if self.hold_index == Some(index) {
                self.load_started.notify_one();
                self.release.notified().await;
            }
            self.loaded.lock().push(index);
            let session = Arc::new(FakeSession::new(self.page_count));
            self.sessions.lock().insert(index, Arc::clone(&session));
            Ok(session)
        }
    }

    fn publication(progression: ReadingProgression) -> Arc<Publication> {
        Arc::new(
            Publication::new(
                "urn:quire:test",
                vec![
                    Link::new("/a.xhtml", "application/xhtml+xml"),
                    Link::new("/b.xhtml", "application/xhtml+xml"),
                    Link::new("/c.xhtml", "application/xhtml+xml"),
                ],
            )
            .with_progression(progression),
        )
    }

    fn locator(href: &str) -> Locator {
        Locator::from_link(&Link::new(href, "application/xhtml+xml"))
    }

    #[tokio::test]
    async fn go_to_loads_scrolls_and_emits() {
        let host = Arc::new(FakeHost::new(3));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        let stream = nav.locator_stream();
        assert!(stream.borrow().is_none());

        let accepted = nav
            .go_to(locator("/b.xhtml").with_locations(Locations::at_progression(0.5)))
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(*host.loaded.lock(), vec![1]);
        assert_eq!(nav.current_index(), Some(1));
        assert_eq!(nav.position_handle().snapshot(), Some(1));

        let emitted = stream.borrow().clone().unwrap();
        assert_eq!(emitted.href, "/b.xhtml");
        assert_eq!(emitted.locations.unwrap().progression, Some(0.5));

        let session = host.session(1).unwrap();
        assert_eq!(session.scrolled_to.lock().len(), 1);
    }

    #[tokio::test]
    async fn go_to_same_resource_skips_the_load() {
        let host = Arc::new(FakeHost::new(3));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());

        nav.go_to(locator("/a.xhtml")).await.unwrap();
        nav.go_to(locator("/a.xhtml").with_locations(Locations::at_progression(0.9)))
            .await
            .unwrap();

        assert_eq!(*host.loaded.lock(), vec![0]);
        let session = host.session(0).unwrap();
        assert_eq!(session.scrolled_to.lock().len(), 2);
    }

    #[tokio::test]
    async fn unresolvable_locator_is_rejected_without_state_change() {
        let host = Arc::new(FakeHost::new(3));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        nav.go_to(locator("/a.xhtml")).await.unwrap();

        match nav.go_to(locator("/nope.xhtml")).await {
            Err(NavError::UnresolvableLocator { href }) => assert_eq!(href, "/nope.xhtml"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(nav.current_index(), Some(0));
        assert_eq!(*host.loaded.lock(), vec![0]);
    }

    #[tokio::test]
    async fn later_go_to_supersedes_an_inflight_one() {
        let host = Arc::new(FakeHost::holding(3, 1));
        let nav = Arc::new(Navigator::new(
            publication(ReadingProgression::Ltr),
            host.clone(),
        ));
        let stream = nav.locator_stream();

        let first = {
            let nav = Arc::clone(&nav);
            tokio::spawn(async move { nav.go_to(locator("/b.xhtml")).await })
        };
        host.load_started.notified().await;

        // Second navigation settles while the first load is parked.
        assert!(nav.go_to(locator("/c.xhtml")).await.unwrap());
        assert_eq!(stream.borrow().clone().unwrap().href, "/c.xhtml");

        host.release.notify_one();
        assert!(!first.await.unwrap().unwrap());

        // The stale completion neither re-emits nor moves the position.
        assert_eq!(stream.borrow().clone().unwrap().href, "/c.xhtml");
        assert_eq!(nav.current_index(), Some(2));
        assert_eq!(nav.position_handle().snapshot(), Some(2));
    }

    #[tokio::test]
    async fn position_handle_is_cleared_while_loading() {
        let host = Arc::new(FakeHost::holding(3, 2));
        let nav = Arc::new(Navigator::new(
            publication(ReadingProgression::Ltr),
            host.clone(),
        ));
        nav.go_to(locator("/a.xhtml")).await.unwrap();
        let handle = nav.position_handle();
        assert_eq!(handle.snapshot(), Some(0));

        let pending = {
            let nav = Arc::clone(&nav);
            tokio::spawn(async move { nav.go_to(locator("/c.xhtml")).await })
        };
        host.load_started.notified().await;
        assert_eq!(handle.snapshot(), None);
        assert_eq!(nav.loading_target(), Some(2));
        assert_eq!(nav.pending_locator().unwrap().href, "/c.xhtml");

        host.release.notify_one();
        assert!(pending.await.unwrap().unwrap());
        assert_eq!(handle.snapshot(), Some(2));
    }

    #[tokio::test]
    async fn forward_steps_within_then_across_resources() {
        let host = Arc::new(FakeHost::new(2));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        let stream = nav.locator_stream();
        nav.go_to(locator("/a.xhtml")).await.unwrap();

        // One sub-position left inside /a.xhtml.
        assert!(nav.go_forward().await.unwrap());
        assert_eq!(nav.current_index(), Some(0));
        let emitted = stream.borrow().clone().unwrap();
        assert_eq!(emitted.href, "/a.xhtml");
        assert_eq!(emitted.locations.unwrap().progression, Some(1.0));

        // At the edge: crosses into /b.xhtml at its start.
        assert!(nav.go_forward().await.unwrap());
        assert_eq!(nav.current_index(), Some(1));
        let emitted = stream.borrow().clone().unwrap();
        assert_eq!(emitted.href, "/b.xhtml");
        assert_eq!(emitted.locations.unwrap().progression, Some(0.0));
    }

    #[tokio::test]
    async fn backward_enters_previous_resource_at_its_end() {
        let host = Arc::new(FakeHost::new(4));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        nav.go_to(locator("/b.xhtml")).await.unwrap();

        // First sub-position of B: stepping back crosses into A's end.
        assert!(nav.go_backward().await.unwrap());
        assert_eq!(nav.current_index(), Some(0));
        let locator = nav.current_locator().unwrap();
        assert_eq!(locator.href, "/a.xhtml");
        assert_eq!(locator.locations.unwrap().progression, Some(1.0));
        assert_eq!(*host.session(0).unwrap().page.lock(), 3);

        // From here, left is backward and right is forward under LTR.
        assert!(nav.go_left().await.unwrap());
        assert_eq!(*host.session(0).unwrap().page.lock(), 2);
        assert!(nav.go_right().await.unwrap());
        assert_eq!(*host.session(0).unwrap().page.lock(), 3);
    }

    #[tokio::test]
    async fn forward_fails_at_the_last_resource_edge() {
        let host = Arc::new(FakeHost::new(2));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        nav.go_to(locator("/c.xhtml").with_locations(Locations::end_of_resource()))
            .await
            .unwrap();

        assert!(!nav.go_forward().await.unwrap());
        assert_eq!(nav.current_index(), Some(2));
        assert_eq!(*host.loaded.lock(), vec![2]);
    }

    #[tokio::test]
    async fn backward_fails_at_the_first_resource_edge() {
        let host = Arc::new(FakeHost::new(2));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        nav.go_to(locator("/a.xhtml")).await.unwrap();

        assert!(!nav.go_backward().await.unwrap());
        assert_eq!(nav.current_index(), Some(0));
    }

    #[tokio::test]
    async fn steps_while_idle_are_no_ops() {
        let host = Arc::new(FakeHost::new(2));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());

        assert!(!nav.go_forward().await.unwrap());
        assert!(!nav.go_backward().await.unwrap());
        assert!(host.loaded.lock().is_empty());
    }

    #[tokio::test]
    async fn left_and_right_follow_ltr_progression() {
        let host = Arc::new(FakeHost::new(1));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());
        nav.go_to(locator("/b.xhtml")).await.unwrap();

        // Single-page resources: every step crosses a resource boundary.
        assert!(nav.go_left().await.unwrap());
        assert_eq!(nav.current_index(), Some(0));
        assert!(nav.go_right().await.unwrap());
        assert_eq!(nav.current_index(), Some(1));
    }

    #[tokio::test]
    async fn left_and_right_invert_under_rtl_progression() {
        let host = Arc::new(FakeHost::new(1));
        let nav = Navigator::new(publication(ReadingProgression::Rtl), host.clone());
        nav.go_to(locator("/b.xhtml")).await.unwrap();

        assert!(nav.go_left().await.unwrap());
        assert_eq!(nav.current_index(), Some(2));
        assert!(nav.go_right().await.unwrap());
        assert_eq!(nav.current_index(), Some(1));
    }

    #[tokio::test]
    async fn go_to_link_targets_the_top_of_the_resource() {
        let host = Arc::new(FakeHost::new(3));
        let nav = Navigator::new(publication(ReadingProgression::Ltr), host.clone());

        let link = Link::new("/c.xhtml", "application/xhtml+xml");
        assert!(nav.go_to_link(&link).await.unwrap());

        let session = host.session(2).unwrap();
        let targets = session.scrolled_to.lock();
        assert_eq!(targets[0].progression, Some(0.0));
    }
}
