//! Message feed state for one active scope.
//!
//! `FeedState` is a plain state machine: every input (snapshot, change-feed
//! event, send outcome) is applied synchronously and tagged with the
//! generation that produced it. The actor in [`crate::synchronizer`] feeds it;
//! tests drive it directly.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use parley_types::{Attachment, ConversationScope, FeedEvent, Message, MessageStatus};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::lifecycle::{EventBuffer, Generation, Phase, SnapshotOutcome};

/// Ascending `created_at`, ties broken by id.
type SortKey = (DateTime<Utc>, String);

/// Immutable snapshot of a feed, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedView {
    pub scope: Option<ConversationScope>,
    pub generation: Generation,
    pub phase: Phase,
    pub messages: Vec<Message>,
    /// Feed-level failure (fetch or change feed)
    pub error: Option<SyncError>,
    /// Why each failed local message failed, keyed by local id
    pub send_errors: BTreeMap<String, SyncError>,
    /// Older messages exist beyond the first one held
    pub has_more: bool,
    pub revision: u64,
}

impl FeedView {
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.id.as_str()).collect()
    }

    /// Nothing to show: no selection, or the selection does not exist.
    pub fn is_empty_state(&self) -> bool {
        self.scope.is_none() || matches!(self.error, Some(SyncError::NotFound(_)))
    }
}

/// How an optimistic send ended.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Confirmed(Message),
    Failed(SyncError),
    TimedOut,
}

/// A pending message matched to a confirmed record by content before its own
/// send answered. The send answer settles whether the match was right.
#[derive(Debug)]
struct Provisional {
    server_id: String,
    local: Message,
}

pub struct FeedState {
    me: String,
    match_window: chrono::Duration,
    page_size: u32,

    scope: Option<ConversationScope>,
    generation: Generation,
    phase: Phase,

    entries: BTreeMap<SortKey, Message>,
    index: HashMap<String, SortKey>,
    buffer: EventBuffer<FeedEvent>,

    /// local id -> provisional match
    provisional: HashMap<String, Provisional>,
    /// Server ids returned by our own sends in this generation
    sent: HashSet<String>,
    /// Ids deleted in this generation; late inserts for them are ignored
    deleted: HashSet<String>,
    send_errors: BTreeMap<String, SyncError>,

    next_local: u64,
    error: Option<SyncError>,
    has_more: bool,
    revision: u64,
}

impl FeedState {
    pub fn new(me: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            me: me.into(),
            match_window: chrono::Duration::from_std(config.match_window)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            page_size: config.page_size,
            scope: None,
            generation: Generation::default(),
            phase: Phase::Idle,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            buffer: EventBuffer::new(config.max_buffered_events),
            provisional: HashMap::new(),
            sent: HashSet::new(),
            deleted: HashSet::new(),
            send_errors: BTreeMap::new(),
            next_local: 1,
            error: None,
            has_more: false,
            revision: 0,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn scope(&self) -> Option<&ConversationScope> {
        self.scope.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.scope.is_some() && generation == self.generation
    }

    pub fn view(&self) -> FeedView {
        FeedView {
            scope: self.scope.clone(),
            generation: self.generation,
            phase: self.phase,
            messages: self.entries.values().cloned().collect(),
            error: self.error.clone(),
            send_errors: self.send_errors.clone(),
            has_more: self.has_more,
            revision: self.revision,
        }
    }

    // -- Lifecycle --

    /// Drop everything held for the previous scope and start loading `scope`.
    pub fn activate(&mut self, scope: ConversationScope) -> Generation {
        self.clear();
        self.generation = self.generation.next();
        self.scope = Some(scope);
        self.phase = Phase::Loading;
        self.touch();
        self.generation
    }

    /// Returns whether a scope was active. Calling it again is a no-op.
    pub fn deactivate(&mut self) -> bool {
        if self.scope.is_none() {
            return false;
        }
        self.clear();
        self.generation = self.generation.next();
        self.scope = None;
        self.phase = Phase::Idle;
        self.touch();
        true
    }

    /// The change feed dropped; buffer events until the repair snapshot lands.
    pub fn begin_resync(&mut self) {
        if self.phase == Phase::Live {
            self.phase = Phase::Resyncing;
            self.touch();
        }
    }

    pub fn fetch_failed(&mut self, generation: Generation, error: SyncError) -> bool {
        if !self.is_current(generation) {
            debug!("Ignoring fetch failure from stale generation {}", generation);
            return false;
        }
        self.error = Some(error);
        self.touch();
        true
    }

    pub fn set_error(&mut self, error: SyncError) {
        self.error = Some(error);
        self.touch();
    }

    /// How many rows the next snapshot should ask for: at least a page, and
    /// enough to reach back over every confirmed message already held.
    pub fn snapshot_limit(&self) -> u32 {
        let held = self
            .entries
            .values()
            .filter(|m| m.status == MessageStatus::Confirmed)
            .count();
        self.page_size.max(u32::try_from(held).unwrap_or(u32::MAX))
    }

    /// Merge the newest `rows` (fetched with `limit`) into the confirmed
    /// contents, keep local pending and failed messages, then replay buffered
    /// events.
    pub fn apply_snapshot(
        &mut self,
        generation: Generation,
        rows: Vec<Message>,
        limit: u32,
    ) -> SnapshotOutcome {
        if !self.is_current(generation) {
            debug!("Discarding stale snapshot from generation {}", generation);
            return SnapshotOutcome::Stale;
        }
        let Some(buffered) = self.buffer.drain() else {
            return SnapshotOutcome::Refetch;
        };

        // A short page is the whole scope. A full page only vouches for rows
        // at or after its oldest one.
        let floor: Option<SortKey> = if rows.len() < limit as usize {
            None
        } else {
            rows.first().map(|m| (m.created_at, m.id.clone()))
        };
        let (overlaps, older_held) = match &floor {
            None => (true, false),
            Some(floor) => (
                self.entries
                    .range(floor.clone()..)
                    .any(|(_, m)| m.status == MessageStatus::Confirmed),
                self.entries
                    .range(..floor.clone())
                    .any(|(_, m)| m.status == MessageStatus::Confirmed),
            ),
        };
        // Held history that does not reach the window would leave a hole;
        // drop it and let `load_older` page back instead.
        let sweep_from = if older_held && !overlaps { None } else { floor.clone() };
        self.has_more = match floor {
            None => false,
            Some(_) if older_held && overlaps => self.has_more,
            Some(_) => true,
        };

        // Confirmed rows in the window but missing from the snapshot were
        // deleted while we were not listening. Our own sends are kept; their
        // deletes arrive as events.
        let gone: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| sweep_from.as_ref().is_none_or(|from| *key >= from))
            .map(|(_, m)| m)
            .filter(|m| m.status == MessageStatus::Confirmed && !self.sent.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
        if !gone.is_empty() {
            debug!("Snapshot sweeps {} messages", gone.len());
        }
        for id in gone {
            self.remove_entry(&id);
        }

        for row in rows {
            self.merge_confirmed(row);
        }
        let replayed = buffered.len();
        for event in buffered {
            self.dispatch(event);
        }

        debug!(
            "Snapshot applied: {} messages, {} buffered events replayed",
            self.entries.len(),
            replayed
        );
        self.phase = Phase::Live;
        self.error = None;
        self.touch();
        SnapshotOutcome::Applied
    }

    /// Merge a page of older messages from `load_older`.
    pub fn apply_older(&mut self, generation: Generation, rows: Vec<Message>, limit: u32) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding stale page from generation {}", generation);
            return false;
        }
        self.has_more = rows.len() >= limit as usize;
        for row in rows {
            self.merge_confirmed(row);
        }
        self.touch();
        true
    }

    /// Oldest confirmed message, the cursor for `load_older`.
    pub fn oldest_confirmed(&self) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .find(|m| m.status == MessageStatus::Confirmed)
            .map(|m| m.created_at)
    }

    // -- Change feed --

    /// Returns whether the view changed. Events are held while a snapshot is
    /// in flight.
    pub fn apply_event(&mut self, generation: Generation, event: FeedEvent) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding {} event from stale generation {}", event.message_id(), generation);
            return false;
        }
        if self.phase.is_buffering() {
            trace!("Buffering event for {}", event.message_id());
            self.buffer.push(event);
            return false;
        }

        let changed = self.dispatch(event);
        if changed {
            self.touch();
        }
        changed
    }

    fn dispatch(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::Insert(message) => self.merge_confirmed(message),
            FeedEvent::Update(message) => self.patch(message),
            FeedEvent::Delete { id } => self.delete(&id),
        }
    }

    fn patch(&mut self, update: Message) -> bool {
        if !self.accepts(&update) {
            return false;
        }
        let Some(existing) = self.entry_mut(&update.id) else {
            trace!("Update for unknown message {}", update.id);
            return false;
        };
        if existing.status == MessageStatus::Failed
            || (existing.content == update.content && existing.attachments == update.attachments)
        {
            return false;
        }
        existing.content = update.content;
        existing.attachments = update.attachments;
        true
    }

    fn delete(&mut self, id: &str) -> bool {
        self.deleted.insert(id.to_string());
        self.sent.remove(id);
        self.remove_entry(id).is_some()
    }

    // -- Optimistic writes --

    /// Insert a pending message authored by the local user. `None` when no
    /// scope is active.
    pub fn insert_local(
        &mut self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let scope = self.scope.as_ref()?;
        let id = format!("local-{}", self.next_local);
        self.next_local += 1;

        let message = Message::compose(
            scope,
            id,
            &self.me,
            content,
            attachments,
            now,
            MessageStatus::Pending,
        );
        self.insert_entry(message.clone());
        self.touch();
        Some(message)
    }

    pub fn complete_send(&mut self, generation: Generation, local_id: &str, outcome: SendOutcome) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding send result for {} from stale generation {}", local_id, generation);
            return false;
        }
        match outcome {
            SendOutcome::Confirmed(record) => self.confirm_send(local_id, record),
            SendOutcome::Failed(error) => self.fail_send(local_id, error, false),
            SendOutcome::TimedOut => self.fail_send(
                local_id,
                SyncError::Conflict {
                    local_id: local_id.to_string(),
                },
                true,
            ),
        }
        self.touch();
        true
    }

    fn confirm_send(&mut self, local_id: &str, record: Message) {
        self.send_errors.remove(local_id);
        self.sent.insert(record.id.clone());

        if let Some(prov) = self.provisional.remove(local_id) {
            let mismatched = prov.server_id != record.id;
            self.merge_owned(record);
            if mismatched {
                debug!(
                    "{} was matched to {} by content but confirmed as another record",
                    local_id, prov.server_id
                );
                self.rematch(&prov.server_id);
            }
            return;
        }

        if self.remove_entry(local_id).is_some() {
            // Another pending send may have claimed this record by content.
            let claimant = self
                .provisional
                .iter()
                .find(|(_, p)| p.server_id == record.id)
                .map(|(id, _)| id.clone());
            if let Some(prov) = claimant.and_then(|id| self.provisional.remove(&id)) {
                debug!("Reinstating {}, its content match belonged to {}", prov.local.id, local_id);
                self.insert_entry(prov.local);
            }
        }
        self.merge_owned(record);
    }

    fn fail_send(&mut self, local_id: &str, error: SyncError, timed_out: bool) {
        if let Some(prov) = self.provisional.remove(local_id) {
            if timed_out {
                // No answer, but a matching record arrived: the write landed.
                self.sent.insert(prov.server_id);
                return;
            }
            let mut local = prov.local;
            local.status = MessageStatus::Failed;
            self.insert_entry(local);
            self.rematch(&prov.server_id);
        } else {
            match self.entry_mut(local_id) {
                Some(entry) if entry.status == MessageStatus::Pending => {
                    entry.status = MessageStatus::Failed;
                }
                _ => return,
            }
        }

        warn!("Send of {} failed: {}", local_id, error);
        self.send_errors.insert(local_id.to_string(), error);
    }

    /// Mark a failed message pending again. Returns it for resending.
    pub fn retry(&mut self, local_id: &str) -> Result<Message, SyncError> {
        let entry = self
            .entry_mut(local_id)
            .filter(|m| m.status == MessageStatus::Failed)
            .ok_or_else(|| SyncError::UnknownMessage(local_id.to_string()))?;
        entry.status = MessageStatus::Pending;
        let message = entry.clone();

        self.send_errors.remove(local_id);
        self.touch();
        Ok(message)
    }

    /// Drop a failed message the user gave up on.
    pub fn discard(&mut self, local_id: &str) -> Result<(), SyncError> {
        if self.entry(local_id).map(|m| m.status) != Some(MessageStatus::Failed) {
            return Err(SyncError::UnknownMessage(local_id.to_string()));
        }
        self.remove_entry(local_id);
        self.send_errors.remove(local_id);
        self.touch();
        Ok(())
    }

    // -- Merging --

    fn accepts(&self, message: &Message) -> bool {
        match &self.scope {
            Some(scope) if message.belongs_to(scope, &self.me) => true,
            Some(scope) => {
                trace!("Rejecting {} outside {}", message.id, scope);
                false
            }
            None => false,
        }
    }

    /// Merge a confirmed record from a snapshot or Insert event. A new id may
    /// settle a pending local message by content.
    fn merge_confirmed(&mut self, record: Message) -> bool {
        let is_new = !self.index.contains_key(&record.id)
            && !self.deleted.contains(&record.id)
            && !self.sent.contains(&record.id)
            && !self.claimed(&record.id);

        if is_new && self.accepts(&record) {
            if let Some(local_id) = self.match_pending(&record) {
                if let Some(local) = self.remove_entry(&local_id) {
                    debug!("Matched {} to pending {}", record.id, local_id);
                    self.provisional.insert(
                        local_id,
                        Provisional {
                            server_id: record.id.clone(),
                            local,
                        },
                    );
                }
            }
        }
        self.merge_owned(record)
    }

    /// Merge a confirmed record by id only: replace in place or insert.
    fn merge_owned(&mut self, mut record: Message) -> bool {
        record.status = MessageStatus::Confirmed;
        if !self.accepts(&record) {
            return false;
        }
        if self.deleted.contains(&record.id) {
            trace!("Ignoring {}, deleted earlier", record.id);
            return false;
        }

        if let Some(key) = self.index.get(&record.id).cloned() {
            // Replacements keep the position of the first copy.
            record.created_at = key.0;
            match self.entries.get(&key) {
                Some(existing) if existing.status == MessageStatus::Failed => return false,
                Some(existing) if *existing == record => return false,
                _ => {}
            }
            self.entries.insert(key, record);
            return true;
        }

        self.insert_entry(record);
        true
    }

    /// Offer a confirmed record nobody owns to the remaining pending messages.
    fn rematch(&mut self, server_id: &str) {
        if self.sent.contains(server_id) || self.claimed(server_id) {
            return;
        }
        let Some(record) = self.entry(server_id).cloned() else {
            return;
        };
        if let Some(local_id) = self.match_pending(&record) {
            if let Some(local) = self.remove_entry(&local_id) {
                debug!("Rematched {} to pending {}", server_id, local_id);
                self.provisional.insert(
                    local_id,
                    Provisional {
                        server_id: server_id.to_string(),
                        local,
                    },
                );
            }
        }
    }

    fn claimed(&self, server_id: &str) -> bool {
        self.provisional.values().any(|p| p.server_id == server_id)
    }

    /// Oldest pending message by the same author with the same content,
    /// timestamped within the match window.
    fn match_pending(&self, record: &Message) -> Option<String> {
        self.entries
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .filter(|m| m.author_id == record.author_id && m.content == record.content)
            .filter(|m| same_attachments(&m.attachments, &record.attachments))
            .find(|m| (m.created_at - record.created_at).abs() <= self.match_window)
            .map(|m| m.id.clone())
    }

    // -- Storage --

    fn entry(&self, id: &str) -> Option<&Message> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Message> {
        let key = self.index.get(id)?;
        self.entries.get_mut(key)
    }

    fn insert_entry(&mut self, message: Message) {
        let key = (message.created_at, message.id.clone());
        if let Some(old) = self.index.insert(message.id.clone(), key.clone()) {
            self.entries.remove(&old);
        }
        self.entries.insert(key, message);
    }

    fn remove_entry(&mut self, id: &str) -> Option<Message> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.buffer.clear();
        self.provisional.clear();
        self.sent.clear();
        self.deleted.clear();
        self.send_errors.clear();
        self.error = None;
        self.has_more = false;
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

fn same_attachments(a: &[Attachment], b: &[Attachment]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.name == y.name)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use parley_types::HostScope;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            channel_id: Some("general".into()),
            dm: None,
            parent_id: None,
            author_id: "bob".into(),
            content: format!("body of {}", id),
            attachments: vec![],
            created_at: t(secs),
            status: MessageStatus::Confirmed,
        }
    }

    fn mine(id: &str, secs: i64, content: &str) -> Message {
        Message {
            author_id: "alice".into(),
            content: content.into(),
            ..msg(id, secs)
        }
    }

    fn live_feed(rows: Vec<Message>) -> (FeedState, Generation) {
        let mut feed = FeedState::new("alice", &SyncConfig::default());
        let generation = feed.activate(ConversationScope::channel("general"));
        assert_eq!(feed.apply_snapshot(generation, rows, 50), SnapshotOutcome::Applied);
        (feed, generation)
    }

    #[test]
    fn insert_after_snapshot_appends() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 0)]);
        assert!(feed.apply_event(generation, FeedEvent::Insert(msg("m2", 1))));

        let view = feed.view();
        assert_eq!(view.ids(), vec!["m1", "m2"]);
        assert_eq!(view.phase, Phase::Live);
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 0)]);
        feed.apply_event(generation, FeedEvent::Insert(msg("m2", 1)));
        let once = feed.view().messages;

        assert!(!feed.apply_event(generation, FeedEvent::Insert(msg("m2", 1))));
        assert_eq!(feed.view().messages, once);
    }

    #[test]
    fn feed_is_sorted_with_id_tie_break() {
        let (mut feed, generation) = live_feed(vec![msg("m5", 5), msg("b", 2)]);
        feed.apply_event(generation, FeedEvent::Insert(msg("a", 2)));
        feed.apply_event(generation, FeedEvent::Insert(msg("m0", 0)));

        assert_eq!(feed.view().ids(), vec!["m0", "a", "b", "m5"]);
    }

    #[test]
    fn thread_replies_stay_out_of_the_channel_feed() {
        let reply = Message {
            parent_id: Some("m1".into()),
            ..msg("r1", 3)
        };

        let (mut feed, generation) = live_feed(vec![msg("m1", 0)]);
        assert!(!feed.apply_event(generation, FeedEvent::Insert(reply.clone())));
        assert_eq!(feed.view().ids(), vec!["m1"]);

        let mut thread = FeedState::new("alice", &SyncConfig::default());
        let generation = thread.activate(ConversationScope::thread(
            "m1",
            HostScope::Channel("general".into()),
        ));
        thread.apply_snapshot(generation, vec![reply.clone()], 50);
        thread.apply_event(generation, FeedEvent::Insert(reply));
        assert_eq!(thread.view().ids(), vec!["r1"]);
    }

    #[test]
    fn events_before_snapshot_are_buffered_and_deduplicated() {
        let mut feed = FeedState::new("alice", &SyncConfig::default());
        let generation = feed.activate(ConversationScope::channel("general"));

        assert!(!feed.apply_event(generation, FeedEvent::Insert(msg("m2", 1))));
        feed.apply_event(generation, FeedEvent::Delete { id: "m0".into() });
        assert!(feed.view().messages.is_empty());

        // The snapshot already saw m2 but not the delete of m0.
        feed.apply_snapshot(generation, vec![msg("m0", 0), msg("m1", 1), msg("m2", 1)], 50);
        assert_eq!(feed.view().ids(), vec!["m1", "m2"]);
    }

    #[test]
    fn stale_snapshot_is_discarded_after_scope_switch() {
        let mut feed = FeedState::new("alice", &SyncConfig::default());
        let first = feed.activate(ConversationScope::channel("a"));
        let second = feed.activate(ConversationScope::channel("b"));

        let a_row = Message {
            channel_id: Some("a".into()),
            ..msg("a1", 0)
        };
        assert_eq!(feed.apply_snapshot(first, vec![a_row], 50), SnapshotOutcome::Stale);
        assert_eq!(feed.phase(), Phase::Loading);

        feed.apply_snapshot(second, vec![], 50);
        assert!(feed.view().messages.is_empty());
        assert_eq!(feed.view().scope, Some(ConversationScope::channel("b")));
    }

    #[test]
    fn send_response_replaces_pending_entry() {
        let (mut feed, generation) = live_feed(vec![]);
        let local = feed.insert_local("hi", vec![], t(10)).unwrap();
        assert_eq!(local.id, "local-1");
        assert_eq!(feed.view().messages[0].status, MessageStatus::Pending);

        feed.complete_send(generation, "local-1", SendOutcome::Confirmed(mine("srv-9", 11, "hi")));
        // The change feed echoes the same record afterwards.
        feed.apply_event(generation, FeedEvent::Insert(mine("srv-9", 11, "hi")));

        let view = feed.view();
        assert_eq!(view.ids(), vec!["srv-9"]);
        assert_eq!(view.messages[0].status, MessageStatus::Confirmed);
    }

    #[test]
    fn insert_event_settles_pending_before_response() {
        let (mut feed, generation) = live_feed(vec![]);
        feed.insert_local("hi", vec![], t(10));

        feed.apply_event(generation, FeedEvent::Insert(mine("srv-9", 11, "hi")));
        assert_eq!(feed.view().ids(), vec!["srv-9"]);

        feed.complete_send(generation, "local-1", SendOutcome::Confirmed(mine("srv-9", 11, "hi")));
        assert_eq!(feed.view().ids(), vec!["srv-9"]);
    }

    #[test]
    fn content_match_respects_author_and_window() {
        let (mut feed, generation) = live_feed(vec![]);
        feed.insert_local("hi", vec![], t(10));

        let from_bob = Message {
            content: "hi".into(),
            ..msg("srv-1", 11)
        };
        feed.apply_event(generation, FeedEvent::Insert(from_bob));
        feed.apply_event(generation, FeedEvent::Insert(mine("srv-2", 500, "hi")));

        assert_eq!(feed.view().ids(), vec!["local-1", "srv-1", "srv-2"]);
    }

    #[test]
    fn identical_sends_confirming_out_of_order_leave_one_entry_each() {
        let (mut feed, generation) = live_feed(vec![]);
        feed.insert_local("hi", vec![], t(10));
        feed.insert_local("hi", vec![], t(11));

        // The second send's record arrives first and is matched to local-1.
        feed.apply_event(generation, FeedEvent::Insert(mine("srv-2", 12, "hi")));
        feed.complete_send(generation, "local-2", SendOutcome::Confirmed(mine("srv-2", 12, "hi")));
        assert_eq!(feed.view().ids(), vec!["local-1", "srv-2"]);

        feed.complete_send(generation, "local-1", SendOutcome::Confirmed(mine("srv-1", 11, "hi")));
        feed.apply_event(generation, FeedEvent::Insert(mine("srv-1", 11, "hi")));

        let view = feed.view();
        assert_eq!(view.ids(), vec!["srv-1", "srv-2"]);
        assert!(view.messages.iter().all(|m| m.status == MessageStatus::Confirmed));
    }

    #[test]
    fn failed_send_is_kept_for_retry_or_discard() {
        let (mut feed, generation) = live_feed(vec![]);
        feed.insert_local("hi", vec![], t(10));
        feed.complete_send(
            generation,
            "local-1",
            SendOutcome::Failed(SyncError::TransientNetwork("offline".into())),
        );

        let view = feed.view();
        assert_eq!(view.messages[0].status, MessageStatus::Failed);
        assert!(view.send_errors.contains_key("local-1"));

        let resend = feed.retry("local-1").unwrap();
        assert_eq!(resend.content, "hi");
        assert_eq!(feed.view().messages[0].status, MessageStatus::Pending);
        assert!(feed.retry("local-1").is_err());

        feed.complete_send(generation, "local-1", SendOutcome::TimedOut);
        assert_eq!(
            feed.view().send_errors.get("local-1"),
            Some(&SyncError::Conflict {
                local_id: "local-1".into()
            })
        );
        feed.discard("local-1").unwrap();
        assert!(feed.view().messages.is_empty());
    }

    #[test]
    fn failed_send_undoes_a_wrong_content_match() {
        let (mut feed, generation) = live_feed(vec![]);
        feed.insert_local("hi", vec![], t(10));
        // Same text sent from another device of the same user.
        feed.apply_event(generation, FeedEvent::Insert(mine("srv-7", 10, "hi")));
        feed.complete_send(
            generation,
            "local-1",
            SendOutcome::Failed(SyncError::TransientNetwork("offline".into())),
        );

        let view = feed.view();
        assert_eq!(view.ids(), vec!["local-1", "srv-7"]);
        assert_eq!(view.get("local-1").unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn update_patches_in_place() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 0), msg("m2", 1)]);
        let edited = Message {
            content: "edited".into(),
            created_at: t(99),
            ..msg("m1", 0)
        };
        assert!(feed.apply_event(generation, FeedEvent::Update(edited)));
        assert!(!feed.apply_event(generation, FeedEvent::Update(msg("m404", 3))));

        let view = feed.view();
        assert_eq!(view.ids(), vec!["m1", "m2"]);
        assert_eq!(view.messages[0].content, "edited");
    }

    #[test]
    fn resync_snapshot_repairs_gap_and_keeps_local_messages() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 0), msg("m2", 1)]);
        feed.insert_local("draft", vec![], t(5));

        feed.begin_resync();
        assert_eq!(feed.phase(), Phase::Resyncing);
        feed.apply_event(generation, FeedEvent::Insert(msg("m4", 4)));

        // m2 was deleted and m3 posted while disconnected.
        feed.apply_snapshot(generation, vec![msg("m1", 0), msg("m3", 3)], 50);

        assert_eq!(feed.view().ids(), vec!["m1", "m3", "m4", "local-1"]);
        assert_eq!(feed.phase(), Phase::Live);
    }

    #[test]
    fn full_snapshot_only_sweeps_its_own_window() {
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let mut feed = FeedState::new("alice", &config);
        let generation = feed.activate(ConversationScope::channel("general"));
        feed.apply_snapshot(generation, vec![msg("m3", 3), msg("m4", 4)], 2);
        feed.apply_older(generation, vec![msg("m1", 1), msg("m2", 2)], 2);
        feed.apply_event(generation, FeedEvent::Insert(msg("m5", 5)));
        assert_eq!(feed.snapshot_limit(), 5);

        // m4 was deleted and m6 posted while disconnected; the page stops at m3.
        feed.begin_resync();
        feed.apply_snapshot(generation, vec![msg("m3", 3), msg("m5", 5), msg("m6", 6)], 3);

        assert_eq!(feed.view().ids(), vec!["m1", "m2", "m3", "m5", "m6"]);
        assert!(feed.has_more());
    }

    #[test]
    fn short_snapshot_is_the_whole_scope() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 1), msg("m2", 2)]);
        feed.begin_resync();
        feed.apply_snapshot(generation, vec![msg("m2", 2)], 50);

        assert_eq!(feed.view().ids(), vec!["m2"]);
        assert!(!feed.has_more());
    }

    #[test]
    fn snapshot_past_held_history_starts_over() {
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let mut feed = FeedState::new("alice", &config);
        let generation = feed.activate(ConversationScope::channel("general"));
        feed.apply_snapshot(generation, vec![msg("m1", 1), msg("m2", 2)], 2);

        feed.begin_resync();
        feed.apply_snapshot(generation, vec![msg("m8", 8), msg("m9", 9)], 2);

        assert_eq!(feed.view().ids(), vec!["m8", "m9"]);
        assert!(feed.has_more());
        assert_eq!(feed.oldest_confirmed(), Some(t(8)));
    }

    #[test]
    fn buffer_overflow_requests_refetch() {
        let config = SyncConfig {
            max_buffered_events: 1,
            ..SyncConfig::default()
        };
        let mut feed = FeedState::new("alice", &config);
        let generation = feed.activate(ConversationScope::channel("general"));
        feed.apply_event(generation, FeedEvent::Insert(msg("m1", 1)));
        feed.apply_event(generation, FeedEvent::Insert(msg("m2", 2)));

        assert_eq!(feed.apply_snapshot(generation, vec![], 50), SnapshotOutcome::Refetch);
        assert_eq!(feed.phase(), Phase::Loading);
        assert_eq!(feed.apply_snapshot(generation, vec![msg("m1", 1)], 50), SnapshotOutcome::Applied);
    }

    #[test]
    fn deactivate_clears_and_is_idempotent() {
        let (mut feed, generation) = live_feed(vec![msg("m1", 0)]);
        assert!(feed.deactivate());
        assert!(!feed.deactivate());

        let view = feed.view();
        assert!(view.messages.is_empty());
        assert_eq!(view.phase, Phase::Idle);
        assert!(view.is_empty_state());
        assert!(!feed.apply_event(generation, FeedEvent::Insert(msg("m2", 1))));
    }

    #[test]
    fn older_page_prepends_and_tracks_has_more() {
        let config = SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        };
        let mut feed = FeedState::new("alice", &config);
        let generation = feed.activate(ConversationScope::channel("general"));
        feed.apply_snapshot(generation, vec![msg("m3", 3), msg("m4", 4)], 2);
        assert!(feed.has_more());
        assert_eq!(feed.oldest_confirmed(), Some(t(3)));

        feed.apply_older(generation, vec![msg("m2", 2)], 2);
        assert!(!feed.has_more());
        assert_eq!(feed.view().ids(), vec!["m2", "m3", "m4"]);
    }
}
