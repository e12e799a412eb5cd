use tracing::{debug, info};

use gamegram_types::{Message, MessageId, PageBound, PageQuery, RoomId};

use crate::store::{Arrival, MessageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitialLoad {
    NotStarted,
    Loading,
    Loaded,
    Failed,
}

/// Backward paging over the room's history.
///
/// The cursor is the oldest loaded id. At most one older-page fetch is in
/// flight; triggers while one is pending are dropped, not queued.
#[derive(Debug)]
pub struct PaginationController {
    room_id: RoomId,
    page_size: u32,
    initial: InitialLoad,
    cursor: Option<MessageId>,
    older_in_flight: Option<MessageId>,
    exhausted: bool,
}

impl PaginationController {
    pub fn new(room_id: RoomId, page_size: u32) -> Self {
        Self {
            room_id,
            page_size: page_size.max(1),
            initial: InitialLoad::NotStarted,
            cursor: None,
            older_in_flight: None,
            exhausted: false,
        }
    }

    pub fn cursor(&self) -> Option<MessageId> {
        self.cursor
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_loading_initial(&self) -> bool {
        self.initial == InitialLoad::Loading
    }

    pub fn is_loaded(&self) -> bool {
        self.initial == InitialLoad::Loaded
    }

    pub fn initial_failed(&self) -> bool {
        self.initial == InitialLoad::Failed
    }

    pub fn is_loading_older(&self) -> bool {
        self.older_in_flight.is_some()
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Query for the newest page, unless one is already loading.
    pub fn begin_initial(&mut self) -> Option<PageQuery> {
        if self.initial == InitialLoad::Loading {
            return None;
        }
        self.initial = InitialLoad::Loading;
        Some(PageQuery {
            room_id: self.room_id,
            bound: PageBound::Latest,
            limit: self.page_size,
        })
    }

    /// Commit the newest page, given newest-first. Returns the number of
    /// records added.
    pub fn complete_initial(&mut self, store: &mut MessageStore, mut page: Vec<Message>) -> usize {
        self.initial = InitialLoad::Loaded;
        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        page.reverse();
        self.lower_cursor(page.iter().filter_map(Message::server_id).min());
        let report = store.apply(Arrival::Snapshot(page));
        info!(inserted = report.inserted, cursor = ?self.cursor, "initial page loaded");
        report.inserted
    }

    pub fn fail_initial(&mut self) {
        self.initial = InitialLoad::Failed;
    }

    /// Query for the page just below the cursor. `None` while the initial
    /// load has not landed, while a fetch is already in flight, or once the
    /// start of history has been reached.
    pub fn begin_older(&mut self) -> Option<PageQuery> {
        if self.initial != InitialLoad::Loaded || self.exhausted {
            return None;
        }
        if let Some(pending) = self.older_in_flight {
            debug!(before = pending, "older page already loading; ignoring trigger");
            return None;
        }
        let before = self.cursor?;
        self.older_in_flight = Some(before);
        Some(PageQuery {
            room_id: self.room_id,
            bound: PageBound::Before(before),
            limit: self.page_size,
        })
    }

    /// Prepend an older page, given newest-first. Returns the number of
    /// records added.
    pub fn complete_older(
        &mut self,
        store: &mut MessageStore,
        before: MessageId,
        mut page: Vec<Message>,
    ) -> usize {
        if self.older_in_flight != Some(before) {
            debug!(before, "discarding older page for a boundary no longer in flight");
            return 0;
        }
        self.older_in_flight = None;
        if (page.len() as u32) < self.page_size {
            self.exhausted = true;
        }
        page.retain(|m| m.server_id().is_some_and(|id| id < before));
        page.reverse();
        self.lower_cursor(page.iter().filter_map(Message::server_id).min());
        let report = store.apply(Arrival::Older(page));
        debug!(
            inserted = report.inserted,
            cursor = ?self.cursor,
            exhausted = self.exhausted,
            "older page loaded"
        );
        report.inserted
    }

    pub fn fail_older(&mut self, before: MessageId) {
        if self.older_in_flight == Some(before) {
            self.older_in_flight = None;
        }
    }

    fn lower_cursor(&mut self, candidate: Option<MessageId>) {
        self.cursor = match (self.cursor, candidate) {
            (Some(current), Some(new)) => Some(current.min(new)),
            (current, new) => current.or(new),
        };
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gamegram_types::{Delivery, MessageKey};

    use super::*;

    fn msg(id: i64) -> Message {
        Message {
            key: MessageKey::Server(id),
            room_id: 1,
            username: "@bo".into(),
            text: format!("#{}", id),
            is_authenticated: false,
            country: None,
            created_at: Utc::now(),
            delivery: Delivery::Sent,
            reactions: vec![],
        }
    }

    fn newest_first(ids: &[i64]) -> Vec<Message> {
        ids.iter().rev().copied().map(msg).collect()
    }

    fn ids(store: &MessageStore) -> Vec<i64> {
        store.snapshot().iter().filter_map(Message::server_id).collect()
    }

    #[test]
    fn initial_load_stores_chronologically_and_sets_cursor() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 50);

        let query = pages.begin_initial().unwrap();
        assert_eq!(query.bound, PageBound::Latest);
        pages.complete_initial(&mut store, newest_first(&[5, 6]));

        assert_eq!(ids(&store), [5, 6]);
        assert_eq!(pages.cursor(), Some(5));
        assert!(pages.is_loaded());
    }

    #[test]
    fn older_page_prepends_without_touching_initial_records() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 3);
        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[7, 8, 9]));
        let before_snapshot: Vec<_> = store.snapshot().to_vec();

        let query = pages.begin_older().unwrap();
        assert_eq!(query.bound, PageBound::Before(7));
        pages.complete_older(&mut store, 7, newest_first(&[4, 5, 6]));

        assert_eq!(ids(&store), [4, 5, 6, 7, 8, 9]);
        assert_eq!(&store.snapshot()[3..], before_snapshot.as_slice());
        assert_eq!(pages.cursor(), Some(4));
    }

    #[test]
    fn at_most_one_older_fetch_in_flight() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 2);
        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[10, 11]));

        assert!(pages.begin_older().is_some());
        assert!(pages.begin_older().is_none());
        assert!(pages.is_loading_older());

        pages.fail_older(10);
        assert!(!pages.is_loading_older());
        assert_eq!(pages.cursor(), Some(10));
        assert!(pages.begin_older().is_some());
    }

    #[test]
    fn older_is_ignored_before_initial_load() {
        let mut pages = PaginationController::new(1, 50);
        assert!(pages.begin_older().is_none());
        pages.begin_initial();
        assert!(pages.begin_older().is_none());
        assert!(pages.begin_initial().is_none());
    }

    #[test]
    fn short_page_marks_history_exhausted() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 3);
        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[4, 5, 6]));
        assert!(pages.has_more());

        pages.begin_older();
        pages.complete_older(&mut store, 4, newest_first(&[1]));
        assert!(!pages.has_more());
        assert!(pages.begin_older().is_none());
    }

    #[test]
    fn empty_room_has_no_cursor() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 50);
        pages.begin_initial();
        pages.complete_initial(&mut store, vec![]);
        assert_eq!(pages.cursor(), None);
        assert!(!pages.has_more());
        assert!(pages.begin_older().is_none());
    }

    #[test]
    fn rows_at_or_above_the_boundary_are_not_prepended() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 2);
        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[5, 6]));

        pages.begin_older();
        pages.complete_older(&mut store, 5, newest_first(&[4, 5]));
        assert_eq!(ids(&store), [4, 5, 6]);
        assert_eq!(pages.cursor(), Some(4));
    }

    #[test]
    fn refresh_never_raises_the_cursor() {
        let mut store = MessageStore::new();
        let mut pages = PaginationController::new(1, 2);
        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[5, 6]));
        pages.begin_older();
        pages.complete_older(&mut store, 5, newest_first(&[3, 4]));

        pages.begin_initial();
        pages.complete_initial(&mut store, newest_first(&[6, 7]));
        assert_eq!(pages.cursor(), Some(3));
        assert_eq!(ids(&store), [3, 4, 5, 6, 7]);
    }
}
