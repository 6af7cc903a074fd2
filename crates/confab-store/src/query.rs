//! Live query engine.
//!
//! A query is an incrementally maintained, sorted window over the
//! entity cache: constructed with a model and an optional predicate, it
//! reacts to the cache's event stream differentially (per-item insert,
//! remove, replace, move) instead of re-running, and pages more results
//! in from the server when its window is not full.
//!
//! [`QueryState`] is the pure core; the client layer owns the driver
//! that feeds it cache events and performs the page fetches it asks
//! for.

use chrono::{DateTime, Utc};
use serde_json::Value;

use confab_shared::constants::MAX_PAGE_SIZE;
use confab_shared::ids::EntityId;
use confab_shared::{ConfabError, Result};

use crate::models::{Conversation, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryModel {
    Conversation,
    Message,
}

/// Whether result entries reference live cache instances (by id) or
/// carry detached snapshots frozen at notification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    Instance,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    CreatedAtDesc,
    LastMessageDesc,
    PositionDesc,
}

impl SortOrder {
    /// Default ordering per model: conversations by creation time,
    /// messages by server position.
    pub fn default_for(model: QueryModel) -> Self {
        match model {
            QueryModel::Conversation => SortOrder::CreatedAtDesc,
            QueryModel::Message => SortOrder::PositionDesc,
        }
    }
}

/// The string constraint scoping a query. The only supported shape is
/// `conversation.id = <id>`, for Message queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    ConversationId(EntityId),
}

impl Predicate {
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((field, value)) = raw.split_once('=') else {
            return Err(ConfabError::Predicate(raw.to_string()));
        };
        if field.trim() != "conversation.id" {
            return Err(ConfabError::Predicate(raw.to_string()));
        }
        let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
        let id = EntityId::parse(value)?;
        Ok(Predicate::ConversationId(id))
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::ConversationId(id) => write!(f, "conversation.id = '{id}'"),
        }
    }
}

/// The query engine's flattened view of one cache entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub created_at: DateTime<Utc>,
    pub position: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub conversation_id: Option<EntityId>,
    pub snapshot: Value,
}

impl From<&Conversation> for EntityRecord {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            created_at: conversation.created_at,
            position: 0,
            last_message_at: conversation.last_message_at,
            conversation_id: None,
            snapshot: serde_json::to_value(conversation).unwrap_or(Value::Null),
        }
    }
}

impl From<&Message> for EntityRecord {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            created_at: message.created_at,
            position: message.position,
            last_message_at: None,
            conversation_id: Some(message.conversation_id.clone()),
            snapshot: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }
}

/// One entry of a query's result window.
#[derive(Debug, Clone)]
pub struct QueryItem {
    pub id: EntityId,
    sort_key: i64,
    /// Detached copy, populated in [`DataMode::Snapshot`] only.
    pub snapshot: Option<Value>,
}

/// UI-consumable change notification emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNotification {
    Reset,
    Insert { index: usize, id: EntityId },
    Remove { index: usize, id: EntityId },
    Replace { index: usize, id: EntityId },
    Move { from: usize, to: usize, id: EntityId },
}

/// What a pagination-window change requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowUpdate {
    NoChange,
    /// The window shrank; these entries were dropped locally with no
    /// network round-trip.
    Truncated(Vec<QueryNotification>),
    /// The window grew; a page fetch is needed.
    NeedsFetch,
}

/// Parameters for the next page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Id of the current last entry, omitted while it is still a
    /// temporary id the server does not know.
    pub cursor: Option<EntityId>,
    pub limit: usize,
}

pub struct QueryState {
    model: QueryModel,
    predicate: Option<Predicate>,
    data_mode: DataMode,
    sort: SortOrder,
    window: usize,
    total_size: usize,
    is_firing: bool,
    data: Vec<QueryItem>,
}

impl QueryState {
    pub fn new(
        model: QueryModel,
        predicate: Option<Predicate>,
        data_mode: DataMode,
        sort: SortOrder,
        window: usize,
    ) -> Self {
        Self {
            model,
            predicate,
            data_mode,
            sort,
            window,
            total_size: 0,
            is_firing: false,
            data: Vec::new(),
        }
    }

    pub fn model(&self) -> QueryModel {
        self.model
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn sort(&self) -> SortOrder {
        self.sort
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Server-reported total result count, which may exceed the
    /// window.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_firing(&self) -> bool {
        self.is_firing
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[QueryItem] {
        &self.data
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.data.iter().map(|item| item.id.clone()).collect()
    }

    fn index_of(&self, id: &EntityId) -> Option<usize> {
        self.data.iter().position(|item| &item.id == id)
    }

    /// Whether a record falls inside this query's scope.
    pub fn matches(&self, record: &EntityRecord) -> bool {
        match (&self.predicate, self.model) {
            (Some(Predicate::ConversationId(pinned)), QueryModel::Message) => {
                record.conversation_id.as_ref() == Some(pinned)
            }
            _ => true,
        }
    }

    fn sort_key(&self, record: &EntityRecord) -> i64 {
        match self.sort {
            SortOrder::CreatedAtDesc => record.created_at.timestamp_millis(),
            SortOrder::LastMessageDesc => record
                .last_message_at
                .unwrap_or(record.created_at)
                .timestamp_millis(),
            SortOrder::PositionDesc => record.position as i64,
        }
    }

    fn item_for(&self, record: &EntityRecord) -> QueryItem {
        QueryItem {
            id: record.id.clone(),
            sort_key: self.sort_key(record),
            snapshot: match self.data_mode {
                DataMode::Snapshot => Some(record.snapshot.clone()),
                DataMode::Instance => None,
            },
        }
    }

    // ------------------------------------------------------------------
    // Differential event application
    // ------------------------------------------------------------------

    /// React to an entity appearing in the cache.
    ///
    /// Genuinely-new matching ids are spliced in at their sorted
    /// position (descending, ties stable by arrival). The window is
    /// never exceeded: an entry pushed past it is evicted, and an
    /// arrival that would land wholly outside it is skipped.
    pub fn apply_add(&mut self, record: &EntityRecord) -> Vec<QueryNotification> {
        if !self.matches(record) || self.index_of(&record.id).is_some() {
            return Vec::new();
        }
        let key = self.sort_key(record);
        let index = self
            .data
            .iter()
            .position(|item| item.sort_key < key)
            .unwrap_or(self.data.len());
        if index >= self.window {
            return Vec::new();
        }
        self.data.insert(index, self.item_for(record));
        let mut notifications = vec![QueryNotification::Insert {
            index,
            id: record.id.clone(),
        }];
        if self.data.len() > self.window {
            if let Some(evicted) = self.data.pop() {
                notifications.push(QueryNotification::Remove {
                    index: self.data.len(),
                    id: evicted.id,
                });
            }
        }
        notifications
    }

    /// React to an entity leaving the cache.
    pub fn apply_remove(&mut self, id: &EntityId) -> Vec<QueryNotification> {
        let Some(index) = self.index_of(id) else {
            return Vec::new();
        };
        self.data.remove(index);
        vec![QueryNotification::Remove {
            index,
            id: id.clone(),
        }]
    }

    /// React to a property change of a cached entity.
    ///
    /// Present entries are replaced positionally (snapshot mode
    /// refreshes the stored copy), except that a last-message change
    /// under last-message sort reorders the entry to the front.
    pub fn apply_change(
        &mut self,
        record: &EntityRecord,
        properties: &[String],
    ) -> Vec<QueryNotification> {
        let Some(index) = self.index_of(&record.id) else {
            return Vec::new();
        };
        let last_message_changed = properties
            .iter()
            .any(|p| p == "last_message_at" || p == "last_message_id");
        if self.sort == SortOrder::LastMessageDesc && last_message_changed && index != 0 {
            self.data.remove(index);
            self.data.insert(0, self.item_for(record));
            return vec![QueryNotification::Move {
                from: index,
                to: 0,
                id: record.id.clone(),
            }];
        }
        if self.data_mode == DataMode::Snapshot {
            self.data[index].snapshot = Some(record.snapshot.clone());
        }
        vec![QueryNotification::Replace {
            index,
            id: record.id.clone(),
        }]
    }

    /// React to a temp-id reconciliation: relocate the entry by old-id
    /// lookup, and rewrite a predicate pinned to the old conversation
    /// id. A rewritten predicate requires a reset-and-refetch, reported
    /// through the returned flag.
    pub fn apply_id_reassigned(
        &mut self,
        old_id: &EntityId,
        new_id: &EntityId,
    ) -> (Vec<QueryNotification>, bool) {
        let mut notifications = Vec::new();
        if let Some(index) = self.index_of(old_id) {
            self.data[index].id = new_id.clone();
            notifications.push(QueryNotification::Replace {
                index,
                id: new_id.clone(),
            });
        }
        let refetch = match &mut self.predicate {
            Some(Predicate::ConversationId(pinned)) if pinned == old_id => {
                *pinned = new_id.clone();
                true
            }
            _ => false,
        };
        (notifications, refetch)
    }

    // ------------------------------------------------------------------
    // Window management and pagination
    // ------------------------------------------------------------------

    /// Change the pagination window. Shrinking truncates locally with
    /// zero network traffic; growing asks for a fetch.
    pub fn set_pagination_window(&mut self, window: usize) -> WindowUpdate {
        self.window = window;
        if self.data.len() > window {
            let mut notifications = Vec::new();
            while self.data.len() > window {
                if let Some(dropped) = self.data.pop() {
                    notifications.push(QueryNotification::Remove {
                        index: self.data.len(),
                        id: dropped.id,
                    });
                }
            }
            WindowUpdate::Truncated(notifications)
        } else if self.data.len() < window {
            WindowUpdate::NeedsFetch
        } else {
            WindowUpdate::NoChange
        }
    }

    /// Swap predicate and sort, clearing the window. The driver emits
    /// the reset notification first, then refetches.
    pub fn reconfigure(
        &mut self,
        predicate: Option<Predicate>,
        sort: SortOrder,
    ) -> QueryNotification {
        self.predicate = predicate;
        self.sort = sort;
        self.reset()
    }

    pub fn reset(&mut self) -> QueryNotification {
        self.data.clear();
        self.total_size = 0;
        self.is_firing = false;
        QueryNotification::Reset
    }

    /// Parameters for the fetch that would fill the window, or `None`
    /// when the window is already satisfied.
    pub fn next_page_request(&self) -> Option<PageRequest> {
        let needed = self.window.saturating_sub(self.data.len());
        if needed == 0 {
            return None;
        }
        let cursor = self.data.last().and_then(|item| {
            if item.id.is_temporary() {
                None
            } else {
                Some(item.id.clone())
            }
        });
        Some(PageRequest {
            cursor,
            limit: needed.min(MAX_PAGE_SIZE),
        })
    }

    pub fn mark_firing(&mut self) {
        self.is_firing = true;
    }

    /// Fold one fetched page into the window, deduplicating against
    /// ids already present.
    pub fn apply_page(
        &mut self,
        records: &[EntityRecord],
        total_size: Option<usize>,
    ) -> Vec<QueryNotification> {
        self.is_firing = false;
        if let Some(total) = total_size {
            self.total_size = total;
        }
        let mut notifications = Vec::new();
        for record in records {
            notifications.extend(self.apply_add(record));
        }
        notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use confab_shared::ids::EntityKind;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conversation_record(suffix: &str, created_secs: i64) -> EntityRecord {
        EntityRecord {
            id: EntityId::new(EntityKind::Conversation, suffix),
            created_at: ts(created_secs),
            position: 0,
            last_message_at: None,
            conversation_id: None,
            snapshot: Value::Null,
        }
    }

    fn message_record(suffix: &str, conversation: &EntityId, position: u64) -> EntityRecord {
        EntityRecord {
            id: EntityId::new(EntityKind::Message, suffix),
            created_at: ts(position as i64),
            position,
            last_message_at: None,
            conversation_id: Some(conversation.clone()),
            snapshot: Value::Null,
        }
    }

    fn conversation_query(window: usize) -> QueryState {
        QueryState::new(
            QueryModel::Conversation,
            None,
            DataMode::Instance,
            SortOrder::CreatedAtDesc,
            window,
        )
    }

    #[test]
    fn test_insertion_keeps_created_at_descending() {
        let mut query = conversation_query(100);
        for (suffix, secs) in [("a", 5), ("b", 20), ("c", 10)] {
            let notifications = query.apply_add(&conversation_record(suffix, secs));
            assert_eq!(notifications.len(), 1);
        }
        let suffixes: Vec<&str> = query.data().iter().map(|item| item.id.suffix()).collect();
        assert_eq!(suffixes, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_equal_sort_keys_are_stable_by_arrival() {
        let conversation = EntityId::new(EntityKind::Conversation, "c1");
        let mut query = QueryState::new(
            QueryModel::Message,
            Some(Predicate::ConversationId(conversation.clone())),
            DataMode::Instance,
            SortOrder::PositionDesc,
            100,
        );
        query.apply_add(&message_record("m1", &conversation, 7));
        query.apply_add(&message_record("m2", &conversation, 7));
        let suffixes: Vec<&str> = query.data().iter().map(|item| item.id.suffix()).collect();
        assert_eq!(suffixes, vec!["m1", "m2"]);
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let mut query = conversation_query(100);
        assert_eq!(query.apply_add(&conversation_record("a", 5)).len(), 1);
        assert!(query.apply_add(&conversation_record("a", 5)).is_empty());
        assert_eq!(query.len(), 1);
    }

    #[test]
    fn test_predicate_scopes_message_adds() {
        let mine = EntityId::new(EntityKind::Conversation, "mine");
        let other = EntityId::new(EntityKind::Conversation, "other");
        let mut query = QueryState::new(
            QueryModel::Message,
            Some(Predicate::ConversationId(mine.clone())),
            DataMode::Instance,
            SortOrder::PositionDesc,
            100,
        );
        assert_eq!(query.apply_add(&message_record("m1", &mine, 1)).len(), 1);
        assert!(query.apply_add(&message_record("m2", &other, 2)).is_empty());
        assert_eq!(query.len(), 1);
    }

    #[test]
    fn test_window_shrink_truncates_without_fetch() {
        let mut query = conversation_query(50);
        for n in 0..80 {
            query.apply_add(&conversation_record(&format!("c{n}"), n));
        }
        assert_eq!(query.len(), 50);

        match query.set_pagination_window(30) {
            WindowUpdate::Truncated(notifications) => {
                assert_eq!(notifications.len(), 20);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
        assert_eq!(query.len(), 30);
        // Satisfied window: no fetch requested.
        assert!(query.next_page_request().is_none());
    }

    #[test]
    fn test_window_grow_requests_fetch_with_cursor() {
        let mut query = conversation_query(2);
        query.apply_add(&conversation_record("a", 10));
        query.apply_add(&conversation_record("b", 5));
        assert!(query.next_page_request().is_none());

        assert_eq!(query.set_pagination_window(40), WindowUpdate::NeedsFetch);
        let request = query.next_page_request().unwrap();
        assert_eq!(request.limit, 38);
        assert_eq!(
            request.cursor,
            Some(EntityId::new(EntityKind::Conversation, "b"))
        );
    }

    #[test]
    fn test_cursor_omitted_while_last_item_is_temporary() {
        let mut query = conversation_query(10);
        let temp = EntityRecord {
            id: EntityId::temporary(EntityKind::Conversation),
            created_at: ts(1),
            position: 0,
            last_message_at: None,
            conversation_id: None,
            snapshot: Value::Null,
        };
        query.apply_add(&temp);
        let request = query.next_page_request().unwrap();
        assert_eq!(request.cursor, None);
        assert_eq!(request.limit, 9);
    }

    #[test]
    fn test_page_limit_clamped_to_max_page_size() {
        let query = conversation_query(500);
        let request = query.next_page_request().unwrap();
        assert_eq!(request.limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_apply_page_dedupes_against_present_ids() {
        let mut query = conversation_query(10);
        query.apply_add(&conversation_record("a", 5));
        let page = vec![conversation_record("a", 5), conversation_record("b", 3)];
        let notifications = query.apply_page(&page, Some(12));
        assert_eq!(notifications.len(), 1);
        assert_eq!(query.len(), 2);
        assert_eq!(query.total_size(), 12);
        assert!(!query.is_firing());
    }

    #[test]
    fn test_last_message_change_reorders_to_front() {
        let mut query = QueryState::new(
            QueryModel::Conversation,
            None,
            DataMode::Instance,
            SortOrder::LastMessageDesc,
            100,
        );
        let mut a = conversation_record("a", 1);
        a.last_message_at = Some(ts(10));
        let mut b = conversation_record("b", 2);
        b.last_message_at = Some(ts(20));
        query.apply_add(&a);
        query.apply_add(&b);
        let suffixes: Vec<&str> = query.data().iter().map(|item| item.id.suffix()).collect();
        assert_eq!(suffixes, vec!["b", "a"]);

        // A new last message on `a` moves it to the front.
        a.last_message_at = Some(ts(30));
        let notifications = query.apply_change(&a, &["last_message_at".to_string()]);
        assert_eq!(
            notifications,
            vec![QueryNotification::Move {
                from: 1,
                to: 0,
                id: a.id.clone(),
            }]
        );
        let suffixes: Vec<&str> = query.data().iter().map(|item| item.id.suffix()).collect();
        assert_eq!(suffixes, vec!["a", "b"]);
    }

    #[test]
    fn test_change_to_absent_entity_is_ignored() {
        let mut query = conversation_query(10);
        let record = conversation_record("ghost", 1);
        assert!(query
            .apply_change(&record, &["unread_count".to_string()])
            .is_empty());
    }

    #[test]
    fn test_id_reassignment_relocates_and_rewrites_predicate() {
        let temp = EntityId::temporary(EntityKind::Conversation);
        let final_id = EntityId::new(EntityKind::Conversation, "real");
        let mut query = QueryState::new(
            QueryModel::Message,
            Some(Predicate::ConversationId(temp.clone())),
            DataMode::Instance,
            SortOrder::PositionDesc,
            100,
        );
        query.apply_add(&message_record("m1", &temp, 1));

        let (notifications, refetch) = query.apply_id_reassigned(&temp, &final_id);
        // The message entry itself has a different id; only the
        // predicate is pinned to the renamed conversation.
        assert!(notifications.is_empty());
        assert!(refetch);
        assert_eq!(
            query.predicate(),
            Some(&Predicate::ConversationId(final_id))
        );
    }

    #[test]
    fn test_predicate_parsing() {
        let id = EntityId::new(EntityKind::Conversation, "c1");
        for raw in [
            "conversation.id = 'confab:///conversations/c1'",
            "conversation.id = \"confab:///conversations/c1\"",
            "conversation.id=confab:///conversations/c1",
        ] {
            assert_eq!(
                Predicate::parse(raw).unwrap(),
                Predicate::ConversationId(id.clone()),
                "{raw}"
            );
        }
        assert!(Predicate::parse("sender.id = 'x'").is_err());
        assert!(Predicate::parse("conversation.id").is_err());
    }

    #[test]
    fn test_reset_clears_window() {
        let mut query = conversation_query(10);
        query.apply_add(&conversation_record("a", 5));
        query.mark_firing();
        assert_eq!(query.reset(), QueryNotification::Reset);
        assert!(query.is_empty());
        assert_eq!(query.total_size(), 0);
        assert!(!query.is_firing());
    }
}
