//! Turns feed views into viewport moves: jump to the bottom when a feed
//! first loads, follow new messages while the reader is at the bottom, and
//! scroll to and flash a highlighted message once it is on screen.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::feed::FeedView;
use crate::lifecycle::Generation;

/// Within this distance of the bottom the reader counts as following along.
pub const NEAR_BOTTOM_PX: f64 = 100.0;

/// Wait after a highlight target appears before scrolling to it, so images
/// and embeds above it have a chance to lay out.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);
pub const SETTLE_POLL: Duration = Duration::from_millis(50);
/// Scroll anyway once the target has not settled for this long.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
pub const HIGHLIGHT_DURATION: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollAction {
    ToBottom { animated: bool },
    /// Center the message in the viewport
    ToMessage { id: String },
    Highlight { id: String },
    ClearHighlight { id: String },
}

/// The rendering surface the coordinator drives.
pub trait Viewport {
    fn distance_from_bottom(&self) -> f64;

    /// Whether the message's content has finished laying out.
    fn is_settled(&self, message_id: &str) -> bool;

    fn scroll_to_bottom(&mut self, animated: bool);

    fn scroll_to_message(&mut self, message_id: &str);

    fn set_highlight(&mut self, message_id: Option<&str>);

    fn is_near_bottom(&self) -> bool {
        self.distance_from_bottom() <= NEAR_BOTTOM_PX
    }
}

pub fn perform<V: Viewport + ?Sized>(viewport: &mut V, action: &ScrollAction) {
    match action {
        ScrollAction::ToBottom { animated } => viewport.scroll_to_bottom(*animated),
        ScrollAction::ToMessage { id } => viewport.scroll_to_message(id),
        ScrollAction::Highlight { id } => viewport.set_highlight(Some(id)),
        ScrollAction::ClearHighlight { .. } => viewport.set_highlight(None),
    }
}

/// What the coordinator remembers about the last view it saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewMark {
    generation: Generation,
    live: bool,
    tail: Option<(DateTime<Utc>, String)>,
}

impl ViewMark {
    pub fn of(view: &FeedView) -> Self {
        Self {
            generation: view.generation,
            live: view.phase.has_snapshot(),
            tail: view.last().map(|m| (m.created_at, m.id.clone())),
        }
    }
}

/// Bottom-scroll decision for a new view.
pub fn decide(prev: &ViewMark, view: &FeedView, near_bottom: bool) -> Option<ScrollAction> {
    if view.scope.is_none() || !view.phase.has_snapshot() {
        return None;
    }
    if prev.generation != view.generation || !prev.live {
        return Some(ScrollAction::ToBottom { animated: false });
    }

    let tail = view.last().map(|m| (m.created_at, m.id.clone()));
    if tail > prev.tail && near_bottom {
        return Some(ScrollAction::ToBottom { animated: true });
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Highlight {
    Idle,
    /// Requested but not in the feed yet
    Armed { id: String },
    Settling {
        id: String,
        since: Instant,
        check_at: Instant,
    },
    Shown { id: String, clear_at: Instant },
}

/// Stateful wrapper around [`decide`] plus the highlight timeline. Time is
/// passed in so the coordinator can be driven without a runtime.
#[derive(Debug)]
pub struct ScrollCoordinator {
    mark: ViewMark,
    highlight: Highlight,
}

impl Default for ScrollCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrollCoordinator {
    pub fn new() -> Self {
        Self {
            mark: ViewMark::default(),
            highlight: Highlight::Idle,
        }
    }

    /// Request a highlight, or cancel one with `None`. A target missing from
    /// `view` waits until a later view contains it.
    pub fn set_highlight(&mut self, id: Option<String>, view: &FeedView, now: Instant) -> Vec<ScrollAction> {
        let mut actions = Vec::new();
        if let Highlight::Shown { id: shown, .. } = &self.highlight {
            actions.push(ScrollAction::ClearHighlight { id: shown.clone() });
        }

        self.highlight = match id {
            Some(id) => Highlight::Armed { id },
            None => Highlight::Idle,
        };
        self.arm_if_present(view, now);
        actions
    }

    pub fn on_view(&mut self, view: &FeedView, near_bottom: bool, now: Instant) -> Vec<ScrollAction> {
        let mut actions = Vec::new();
        if let Some(action) = decide(&self.mark, view, near_bottom) {
            trace!("Scroll decision for {}: {:?}", view.generation, action);
            actions.push(action);
        }
        self.mark = ViewMark::of(view);
        self.arm_if_present(view, now);
        actions
    }

    /// Advance the highlight timeline to `now`.
    pub fn tick(&mut self, now: Instant, settled: impl Fn(&str) -> bool) -> Vec<ScrollAction> {
        match &self.highlight {
            Highlight::Settling {
                id,
                since,
                check_at,
            } if now >= *check_at => {
                let (id, since) = (id.clone(), *since);
                let gave_up = now >= since + SETTLE_DELAY + SETTLE_TIMEOUT;
                if !settled(&id) && !gave_up {
                    self.highlight = Highlight::Settling {
                        id,
                        since,
                        check_at: now + SETTLE_POLL,
                    };
                    return Vec::new();
                }

                debug!("Highlighting {}", id);
                self.highlight = Highlight::Shown {
                    id: id.clone(),
                    clear_at: now + HIGHLIGHT_DURATION,
                };
                vec![
                    ScrollAction::ToMessage { id: id.clone() },
                    ScrollAction::Highlight { id },
                ]
            }
            Highlight::Shown { id, clear_at } if now >= *clear_at => {
                let id = id.clone();
                self.highlight = Highlight::Idle;
                vec![ScrollAction::ClearHighlight { id }]
            }
            _ => Vec::new(),
        }
    }

    /// When `tick` next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.highlight {
            Highlight::Settling { check_at, .. } => Some(*check_at),
            Highlight::Shown { clear_at, .. } => Some(*clear_at),
            _ => None,
        }
    }

    /// Drive `viewport` from feed views and highlight requests until the feed
    /// goes away.
    pub async fn run<V: Viewport>(
        mut self,
        mut views: watch::Receiver<FeedView>,
        mut highlights: mpsc::UnboundedReceiver<Option<String>>,
        mut viewport: V,
    ) {
        let view = views.borrow_and_update().clone();
        let actions = self.on_view(&view, viewport.is_near_bottom(), Instant::now());
        apply_all(&mut viewport, &actions);

        loop {
            let deadline = self.next_deadline();
            let actions = tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let view = views.borrow_and_update().clone();
                    self.on_view(&view, viewport.is_near_bottom(), Instant::now())
                }
                Some(request) = highlights.recv() => {
                    let view = views.borrow().clone();
                    self.set_highlight(request, &view, Instant::now())
                }
                _ = wait_until(deadline) => {
                    self.tick(Instant::now(), |id| viewport.is_settled(id))
                }
            };
            apply_all(&mut viewport, &actions);
        }
        debug!("Scroll coordinator stopped");
    }

    fn arm_if_present(&mut self, view: &FeedView, now: Instant) {
        if let Highlight::Armed { id } = &self.highlight {
            if view.contains(id) {
                self.highlight = Highlight::Settling {
                    id: id.clone(),
                    since: now,
                    check_at: now + SETTLE_DELAY,
                };
            }
        }
    }
}

fn apply_all<V: Viewport>(viewport: &mut V, actions: &[ScrollAction]) {
    for action in actions {
        perform(viewport, action);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use parley_types::{ConversationScope, Message, MessageStatus};

    use super::*;
    use crate::lifecycle::Phase;

    fn message(id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            channel_id: Some("general".into()),
            dm: None,
            parent_id: None,
            author_id: "bob".into(),
            content: id.into(),
            attachments: vec![],
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(secs),
            status: MessageStatus::Confirmed,
        }
    }

    fn view(generation: Generation, phase: Phase, ids: &[(&str, i64)]) -> FeedView {
        FeedView {
            scope: Some(ConversationScope::channel("general")),
            generation,
            phase,
            messages: ids.iter().map(|(id, secs)| message(id, *secs)).collect(),
            ..FeedView::default()
        }
    }

    #[test]
    fn first_live_view_jumps_to_bottom() {
        let g = Generation::default().next();
        let loading = view(g, Phase::Loading, &[]);
        assert_eq!(decide(&ViewMark::default(), &loading, false), None);

        let live = view(g, Phase::Live, &[("m1", 1)]);
        assert_eq!(
            decide(&ViewMark::of(&loading), &live, false),
            Some(ScrollAction::ToBottom { animated: false })
        );
    }

    #[test]
    fn appends_follow_only_near_bottom() {
        let g = Generation::default().next();
        let before = view(g, Phase::Live, &[("m1", 1)]);
        let after = view(g, Phase::Live, &[("m1", 1), ("m2", 2)]);
        let mark = ViewMark::of(&before);

        assert_eq!(
            decide(&mark, &after, true),
            Some(ScrollAction::ToBottom { animated: true })
        );
        assert_eq!(decide(&mark, &after, false), None);
    }

    #[test]
    fn older_pages_and_edits_do_not_scroll() {
        let g = Generation::default().next();
        let before = view(g, Phase::Live, &[("m5", 5)]);
        let prepended = view(g, Phase::Live, &[("m1", 1), ("m5", 5)]);
        assert_eq!(decide(&ViewMark::of(&before), &prepended, true), None);
    }

    #[test]
    fn new_scope_jumps_again() {
        let first = Generation::default().next();
        let before = view(first, Phase::Live, &[("m1", 1)]);
        let switched = view(first.next(), Phase::Live, &[("x1", 1)]);
        assert_eq!(
            decide(&ViewMark::of(&before), &switched, false),
            Some(ScrollAction::ToBottom { animated: false })
        );
    }

    #[test]
    fn highlight_waits_for_the_target_then_clears() {
        let g = Generation::default().next();
        let start = Instant::now();
        let mut coordinator = ScrollCoordinator::new();

        let without = view(g, Phase::Live, &[("m1", 1)]);
        coordinator.on_view(&without, true, start);
        coordinator.set_highlight(Some("m7".into()), &without, start);
        assert_eq!(coordinator.next_deadline(), None);

        let with = view(g, Phase::Live, &[("m1", 1), ("m7", 7)]);
        coordinator.on_view(&with, false, start);
        assert_eq!(coordinator.next_deadline(), Some(start + SETTLE_DELAY));

        assert!(coordinator.tick(start + SETTLE_DELAY, |_| false).is_empty());
        let shown_at = start + SETTLE_DELAY + SETTLE_POLL;
        assert_eq!(
            coordinator.tick(shown_at, |_| true),
            vec![
                ScrollAction::ToMessage { id: "m7".into() },
                ScrollAction::Highlight { id: "m7".into() },
            ]
        );
        assert_eq!(
            coordinator.tick(shown_at + HIGHLIGHT_DURATION, |_| true),
            vec![ScrollAction::ClearHighlight { id: "m7".into() }]
        );
        assert_eq!(coordinator.next_deadline(), None);
    }

    #[test]
    fn unsettled_target_is_shown_after_timeout() {
        let g = Generation::default().next();
        let start = Instant::now();
        let mut coordinator = ScrollCoordinator::new();
        let feed = view(g, Phase::Live, &[("m7", 7)]);
        coordinator.set_highlight(Some("m7".into()), &feed, start);

        let late = start + SETTLE_DELAY + SETTLE_TIMEOUT;
        assert_eq!(coordinator.tick(late, |_| false).len(), 2);
    }

    #[derive(Clone, Default)]
    struct FakeViewport {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Viewport for FakeViewport {
        fn distance_from_bottom(&self) -> f64 {
            0.0
        }

        fn is_settled(&self, _message_id: &str) -> bool {
            true
        }

        fn scroll_to_bottom(&mut self, animated: bool) {
            self.log.lock().unwrap().push(format!("bottom animated={}", animated));
        }

        fn scroll_to_message(&mut self, message_id: &str) {
            self.log.lock().unwrap().push(format!("to {}", message_id));
        }

        fn set_highlight(&mut self, message_id: Option<&str>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("highlight {}", message_id.unwrap_or("-")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_drives_the_viewport() {
        let g = Generation::default().next();
        let (views_tx, views_rx) = watch::channel(view(g, Phase::Loading, &[]));
        let (highlight_tx, highlight_rx) = mpsc::unbounded_channel();
        let viewport = FakeViewport::default();
        let log = viewport.log.clone();

        let task = tokio::spawn(ScrollCoordinator::new().run(views_rx, highlight_rx, viewport));

        highlight_tx.send(Some("m7".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        views_tx.send_replace(view(g, Phase::Live, &[("m1", 1)]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        views_tx.send_replace(view(g, Phase::Live, &[("m1", 1), ("m7", 7)]));
        tokio::time::sleep(SETTLE_DELAY + HIGHLIGHT_DURATION + Duration::from_millis(100)).await;

        drop(views_tx);
        task.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "bottom animated=false",
                "bottom animated=true",
                "to m7",
                "highlight m7",
                "highlight -",
            ]
        );
    }
}
