//! Feed synchronizer: keeps a view's post collection in line with the store.
//!
//! One spawned task per view. It loads the collection once, then refetches
//! the whole collection on every post, comment or vote change and replaces
//! the local copy wholesale. Optimistic edits that are still pending are
//! re-applied on top of every new snapshot with idempotent rules, so with no
//! pending edits the local collection equals the last snapshot exactly.

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{select_view, Comment, Post, Tab, VoteDirection};
use crate::error::{InteractionError, SubscriptionError};
use crate::repository::{ChangeFeed, ChangeStream, PostStore};
use crate::retry::{with_retry, RetryConfig};
use crate::services::notifier::{Notifier, Toast};

pub const LOAD_FAILED_MESSAGE: &str = "Failed to load posts. Please refresh the page.";

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Backoff policy for resubscribing after the change stream fails
    pub resubscribe: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Live,
    Reconnecting,
    /// Resubscription gave up; the collection no longer follows the store
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditId(u64);

/// Local change not yet reflected in an authoritative snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEdit {
    /// The user's intended final vote on the post
    Vote {
        post_id: Uuid,
        user_id: String,
        vote: Option<VoteDirection>,
    },
    Comment {
        post_id: Uuid,
        comment: Comment,
        /// Comments by the same author with the same text the post already had
        prior_matches: usize,
        /// `comment` is the stored copy and is matched by id
        stored: bool,
    },
    Post {
        post: Post,
    },
}

impl PendingEdit {
    /// Apply on top of `posts`. Applying twice has the same effect as once.
    pub fn apply(&self, posts: &mut Vec<Post>) {
        match self {
            PendingEdit::Vote {
                post_id,
                user_id,
                vote,
            } => {
                if let Some(post) = posts.iter_mut().find(|p| p.id == *post_id) {
                    post.votes.set_vote(user_id, *vote);
                }
            }
            PendingEdit::Comment {
                post_id,
                comment,
                prior_matches,
                stored,
            } => {
                if let Some(post) = posts.iter_mut().find(|p| p.id == *post_id) {
                    let present = if *stored {
                        post.comments.contains(comment.id)
                    } else {
                        post.comments.count_equivalent(comment) > *prior_matches
                    };
                    if !present {
                        post.comments.prepend(comment.clone());
                    }
                }
            }
            PendingEdit::Post { post } => {
                if !posts
                    .iter()
                    .any(|p| p.id == post.id || p.same_submission(post))
                {
                    posts.insert(0, post.clone());
                }
            }
        }
    }
}

struct TrackedEdit {
    id: EditId,
    edit: PendingEdit,
    /// Number of fetches started when the store acknowledged the edit.
    /// Any later fetch already contains it.
    confirmed_at: Option<u64>,
}

struct FeedState {
    snapshot: Vec<Post>,
    posts: Vec<Post>,
    pending: Vec<TrackedEdit>,
    loading: bool,
    status: SyncStatus,
    fetches_started: u64,
    last_applied_fetch: u64,
    next_edit: u64,
}

impl FeedState {
    fn new() -> Self {
        Self {
            snapshot: Vec::new(),
            posts: Vec::new(),
            pending: Vec::new(),
            loading: true,
            status: SyncStatus::Connecting,
            fetches_started: 0,
            last_applied_fetch: 0,
            next_edit: 0,
        }
    }

    fn rebuild(&mut self) {
        let mut posts = self.snapshot.clone();
        for tracked in &self.pending {
            tracked.edit.apply(&mut posts);
        }
        self.posts = posts;
    }

    fn track(&mut self, edit: PendingEdit) -> EditId {
        self.next_edit += 1;
        let id = EditId(self.next_edit);
        edit.apply(&mut self.posts);
        self.pending.push(TrackedEdit {
            id,
            edit,
            confirmed_at: None,
        });
        id
    }

    fn tracked_mut(&mut self, id: EditId) -> Option<&mut TrackedEdit> {
        self.pending.iter_mut().find(|t| t.id == id)
    }
}

struct FeedShared {
    state: RwLock<FeedState>,
    version: watch::Sender<u64>,
    /// Asks the synchronizer for a refetch outside the change stream
    refresh: Notify,
}

impl FeedShared {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: RwLock::new(FeedState::new()),
            version,
            refresh: Notify::new(),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut FeedState) -> R) -> R {
        let result = f(&mut self.state.write());
        self.version.send_modify(|v| *v += 1);
        result
    }

    fn set_status(&self, status: SyncStatus) {
        self.update(|state| {
            if state.status != SyncStatus::Stopped {
                state.status = status;
            }
        });
    }

    fn begin_fetch(&self) -> u64 {
        let mut state = self.state.write();
        state.fetches_started += 1;
        state.fetches_started
    }

    /// Replace the collection with a snapshot from fetch `ticket`.
    ///
    /// Returns false when the snapshot is discarded: the feed is stopped or a
    /// newer fetch has already been applied.
    fn apply_snapshot(&self, ticket: u64, snapshot: Vec<Post>) -> bool {
        self.update(|state| {
            if state.status == SyncStatus::Stopped || ticket <= state.last_applied_fetch {
                return false;
            }
            state.last_applied_fetch = ticket;
            state.snapshot = snapshot;
            state.loading = false;
            state
                .pending
                .retain(|t| t.confirmed_at.map_or(true, |at| ticket <= at));
            state.rebuild();
            true
        })
    }

    fn finish_loading(&self) {
        self.update(|state| state.loading = false);
    }

    /// Mark an edit acknowledged by the store, optionally swapping in the
    /// stored copy, and ask for a refetch that will contain it.
    fn confirm(&self, id: EditId, stored: Option<PendingEdit>) {
        self.update(|state| {
            let fetches = state.fetches_started;
            if let Some(tracked) = state.tracked_mut(id) {
                if let Some(edit) = stored {
                    tracked.edit = edit;
                }
                tracked.confirmed_at = Some(fetches);
            }
            state.rebuild();
        });
        self.refresh.notify_one();
    }

    fn rollback(&self, id: EditId) {
        self.update(|state| {
            state.pending.retain(|t| t.id != id);
            state.rebuild();
        });
    }
}

/// An optimistic edit awaiting the store's answer.
///
/// Dropping the guard before it is confirmed rolls the edit back, so an
/// abandoned action never leaves a phantom change on the collection.
#[must_use = "an unconfirmed edit is rolled back when dropped"]
pub struct EditGuard {
    shared: Arc<FeedShared>,
    id: EditId,
    settled: bool,
}

impl EditGuard {
    pub fn id(&self) -> EditId {
        self.id
    }

    /// The store accepted the edit. It stays applied until a snapshot fetched
    /// afterwards arrives.
    pub fn confirm(mut self) {
        self.settled = true;
        self.shared.confirm(self.id, None);
    }

    /// Confirm a comment edit, swapping the provisional comment for the stored one
    pub fn confirm_comment(mut self, stored: Comment) {
        self.settled = true;
        let edit = self.shared.state.read().pending.iter().find_map(|t| match &t.edit {
            PendingEdit::Comment {
                post_id,
                prior_matches,
                ..
            } if t.id == self.id => Some(PendingEdit::Comment {
                post_id: *post_id,
                comment: stored.clone(),
                prior_matches: *prior_matches,
                stored: true,
            }),
            _ => None,
        });
        self.shared.confirm(self.id, edit);
    }

    /// Confirm a post edit, swapping the provisional post for the stored one
    pub fn confirm_post(mut self, stored: Post) {
        self.settled = true;
        self.shared
            .confirm(self.id, Some(PendingEdit::Post { post: stored }));
    }

    /// Withdraw an edit the store rejected, restoring the snapshot state
    pub fn rollback(mut self) {
        self.settled = true;
        self.shared.rollback(self.id);
    }
}

impl Drop for EditGuard {
    fn drop(&mut self) {
        if !self.settled {
            debug!(edit = ?self.id, "Rolling back abandoned edit");
            self.shared.rollback(self.id);
        }
    }
}

/// Aborts the synchronizer task when the last handle goes away
struct TaskGuard(Mutex<Option<JoinHandle<()>>>);

impl TaskGuard {
    fn abort(&self) {
        if let Some(task) = self.0.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.abort();
    }
}

/// View-side handle on a running synchronizer.
///
/// Clones share the same feed. Dropping the last clone stops the task.
#[derive(Clone)]
pub struct FeedHandle {
    shared: Arc<FeedShared>,
    task: Arc<TaskGuard>,
}

impl FeedHandle {
    /// Current collection, pending edits included
    pub fn posts(&self) -> Vec<Post> {
        self.shared.state.read().posts.clone()
    }

    pub fn post(&self, post_id: Uuid) -> Option<Post> {
        self.shared
            .state
            .read()
            .posts
            .iter()
            .find(|p| p.id == post_id)
            .cloned()
    }

    /// Last authoritative snapshot, without pending edits
    pub fn snapshot(&self) -> Vec<Post> {
        self.shared.state.read().snapshot.clone()
    }

    pub fn view(&self, tab: Tab) -> Vec<Post> {
        select_view(&self.shared.state.read().posts, tab)
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.state.read().status
    }

    pub fn is_loading(&self) -> bool {
        self.shared.state.read().loading
    }

    pub fn pending_edits(&self) -> Vec<PendingEdit> {
        self.shared
            .state
            .read()
            .pending
            .iter()
            .map(|t| t.edit.clone())
            .collect()
    }

    /// Receiver whose value changes on every collection or status change
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.shared.version.subscribe()
    }

    /// Stop following the store. Results still in flight are discarded.
    pub fn shutdown(&self) {
        self.task.abort();
        self.shared.update(|state| {
            state.status = SyncStatus::Stopped;
            state.loading = false;
        });
        info!("Feed synchronizer stopped");
    }

    fn guard(&self, id: EditId) -> EditGuard {
        EditGuard {
            shared: Arc::clone(&self.shared),
            id,
            settled: false,
        }
    }

    /// Optimistically apply the toggle rules for `user_id`.
    ///
    /// Records the resulting vote state, not the toggle, so re-applying it on
    /// a snapshot that already contains the vote changes nothing.
    pub fn begin_vote(
        &self,
        post_id: Uuid,
        user_id: &str,
        direction: VoteDirection,
    ) -> Result<EditGuard, InteractionError> {
        let id = self.shared.update(|state| {
            let post = state
                .posts
                .iter_mut()
                .find(|p| p.id == post_id)
                .ok_or(InteractionError::PostNotFound(post_id))?;
            let vote = post.cast_vote(user_id, direction).resulting_vote();
            Ok::<_, InteractionError>(state.track(PendingEdit::Vote {
                post_id,
                user_id: user_id.to_string(),
                vote,
            }))
        })?;
        Ok(self.guard(id))
    }

    pub fn begin_comment(
        &self,
        post_id: Uuid,
        comment: Comment,
    ) -> Result<EditGuard, InteractionError> {
        let id = self.shared.update(|state| {
            let prior_matches = state
                .posts
                .iter()
                .find(|p| p.id == post_id)
                .map(|p| p.comments.count_equivalent(&comment))
                .ok_or(InteractionError::PostNotFound(post_id))?;
            Ok::<_, InteractionError>(state.track(PendingEdit::Comment {
                post_id,
                comment,
                prior_matches,
                stored: false,
            }))
        })?;
        Ok(self.guard(id))
    }

    pub fn begin_post(&self, post: Post) -> EditGuard {
        let id = self
            .shared
            .update(|state| state.track(PendingEdit::Post { post }));
        self.guard(id)
    }
}

pub struct FeedSynchronizer {
    store: Arc<dyn PostStore>,
    changes: Arc<dyn ChangeFeed>,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    shared: Arc<FeedShared>,
}

impl FeedSynchronizer {
    /// Spawn a synchronizer for one view
    pub fn start(
        store: Arc<dyn PostStore>,
        changes: Arc<dyn ChangeFeed>,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> FeedHandle {
        let shared = Arc::new(FeedShared::new());
        let synchronizer = FeedSynchronizer {
            store,
            changes,
            notifier,
            config,
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(synchronizer.run());

        FeedHandle {
            shared,
            task: Arc::new(TaskGuard(Mutex::new(Some(task)))),
        }
    }

    async fn run(self) {
        // Subscribe before the first load so no change between the two is missed.
        let first = self.changes.subscribe().await;
        self.cold_start().await;

        let mut next = match first {
            Ok(stream) => {
                self.shared.set_status(SyncStatus::Live);
                Some(stream)
            }
            Err(e) => {
                warn!(error = %e, "Initial change subscription failed");
                None
            }
        };

        loop {
            let mut stream = match next.take() {
                Some(stream) => stream,
                None => match self.resubscribe().await {
                    Some(stream) => stream,
                    None => return,
                },
            };
            self.follow(&mut stream).await;
        }
    }

    async fn cold_start(&self) {
        let ticket = self.shared.begin_fetch();
        match self.store.fetch_all_posts().await {
            Ok(posts) => {
                info!(posts = posts.len(), "Loaded post collection");
                self.shared.apply_snapshot(ticket, posts);
            }
            Err(e) => {
                error!(error = %e, "Failed to load posts");
                self.notifier
                    .notify(Toast::destructive("Error", LOAD_FAILED_MESSAGE));
                self.shared.finish_loading();
            }
        }
    }

    async fn refresh(&self, reason: &'static str) {
        let ticket = self.shared.begin_fetch();
        match self.store.fetch_all_posts().await {
            Ok(posts) => {
                let count = posts.len();
                if self.shared.apply_snapshot(ticket, posts) {
                    debug!(reason, posts = count, "Replaced post collection");
                } else {
                    debug!(reason, ticket, "Discarded stale snapshot");
                }
            }
            Err(e) => error!(reason, error = %e, "Failed to refresh posts after change"),
        }
    }

    /// Drain one subscription until it fails or ends
    async fn follow(&self, stream: &mut ChangeStream) {
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = self.shared.refresh.notified() => {
                    self.refresh("edit confirmed").await;
                    continue;
                }
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(event) if event.table.affects_posts() => {
                    debug!(
                        table = %event.table,
                        action = ?event.action,
                        record_id = ?event.record_id,
                        "Post change received"
                    );
                    self.refresh("change").await;
                }
                Ok(event) => debug!(table = %event.table, "Ignoring change outside the feed"),
                Err(SubscriptionError::Lagged(missed)) => {
                    warn!(missed, "Change stream lagged");
                    self.refresh("lagged").await;
                }
                Err(e) => {
                    warn!(error = %e, "Change subscription failed");
                    return;
                }
            }
        }
        warn!("Change stream ended");
    }

    async fn resubscribe(&self) -> Option<ChangeStream> {
        self.shared.set_status(SyncStatus::Reconnecting);

        let changes = Arc::clone(&self.changes);
        let subscribed = with_retry(&self.config.resubscribe, "change feed subscription", || {
            let changes = Arc::clone(&changes);
            async move { changes.subscribe().await }
        })
        .await;

        match subscribed {
            Ok(stream) => {
                info!("Resubscribed to change feed");
                self.shared.set_status(SyncStatus::Live);
                self.refresh("resubscribed").await;
                Some(stream)
            }
            Err(e) => {
                error!(error = %e, "Giving up on change feed subscription");
                self.shared.set_status(SyncStatus::Disconnected);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{create_post, Identity};
    use crate::domain::thread::new_comment;
    use chrono::Utc;

    fn post(content: &str) -> Post {
        let draft = create_post("author", "Ada", None, content).unwrap();
        Post::from_draft(draft, Uuid::new_v4(), Utc::now())
    }

    fn uma() -> Identity {
        Identity::new("user_u", "Uma")
    }

    #[test]
    fn test_pending_vote_reapply_is_idempotent() {
        let mut posts = vec![post("a")];
        let edit = PendingEdit::Vote {
            post_id: posts[0].id,
            user_id: "user_u".into(),
            vote: Some(VoteDirection::Upvote),
        };

        edit.apply(&mut posts);
        edit.apply(&mut posts);
        assert_eq!(posts[0].upvotes(), 1);
    }

    #[test]
    fn test_pending_comment_not_duplicated() {
        let mut posts = vec![post("a")];
        let comment = new_comment(Some(&uma()), "hello").unwrap();
        let edit = PendingEdit::Comment {
            post_id: posts[0].id,
            comment: comment.clone(),
            prior_matches: 0,
            stored: false,
        };

        edit.apply(&mut posts);
        edit.apply(&mut posts);
        assert_eq!(posts[0].comment_count(), 1);

        // A stored copy with its own id counts as the same comment
        let mut stored_snapshot = vec![posts[0].clone()];
        stored_snapshot[0].comments = Default::default();
        stored_snapshot[0].comments.prepend(Comment {
            id: Uuid::new_v4(),
            ..comment
        });
        edit.apply(&mut stored_snapshot);
        assert_eq!(stored_snapshot[0].comment_count(), 1);
    }

    #[test]
    fn test_repeated_comment_text_is_not_hidden() {
        let earlier = new_comment(Some(&uma()), "+1").unwrap();
        let mut base = post("a");
        base.comments.prepend(Comment {
            id: Uuid::new_v4(),
            ..earlier
        });

        // In flight: the earlier "+1" does not stand in for the new one
        let provisional = new_comment(Some(&uma()), "+1").unwrap();
        let pending = PendingEdit::Comment {
            post_id: base.id,
            comment: provisional.clone(),
            prior_matches: 1,
            stored: false,
        };
        let mut posts = vec![base.clone()];
        pending.apply(&mut posts);
        assert_eq!(posts[0].comment_count(), 2);

        // Confirmed: only the stored id counts
        let stored = Comment {
            id: Uuid::new_v4(),
            ..provisional
        };
        let confirmed = PendingEdit::Comment {
            post_id: base.id,
            comment: stored.clone(),
            prior_matches: 1,
            stored: true,
        };
        let mut stale = vec![base.clone()];
        confirmed.apply(&mut stale);
        assert_eq!(stale[0].comment_count(), 2);

        let mut fresh = vec![base];
        fresh[0].comments.prepend(stored);
        confirmed.apply(&mut fresh);
        assert_eq!(fresh[0].comment_count(), 2);
    }

    #[test]
    fn test_pending_post_matches_stored_submission() {
        let provisional = post("fresh");
        let stored = Post {
            id: Uuid::new_v4(),
            ..provisional.clone()
        };
        let mut posts = vec![stored];
        PendingEdit::Post { post: provisional }.apply(&mut posts);
        assert_eq!(posts.len(), 1);
    }

    #[test]
    fn test_stale_snapshot_is_discarded() {
        let shared = FeedShared::new();
        let older = shared.begin_fetch();
        let newer = shared.begin_fetch();

        assert!(shared.apply_snapshot(newer, vec![post("new")]));
        assert!(!shared.apply_snapshot(older, vec![]));
        assert_eq!(shared.state.read().posts.len(), 1);
    }

    #[test]
    fn test_confirmed_edit_dropped_by_later_fetch_only() {
        let shared = FeedShared::new();
        let base = post("a");
        let ticket = shared.begin_fetch();
        shared.apply_snapshot(ticket, vec![base.clone()]);

        let in_flight = shared.begin_fetch();
        let id = shared.update(|state| {
            state.track(PendingEdit::Vote {
                post_id: base.id,
                user_id: "u".into(),
                vote: Some(VoteDirection::Downvote),
            })
        });
        shared.update(|state| {
            let fetches = state.fetches_started;
            state.tracked_mut(id).unwrap().confirmed_at = Some(fetches);
        });

        // Started before the confirmation: the edit survives
        shared.apply_snapshot(in_flight, vec![base.clone()]);
        assert_eq!(shared.state.read().posts[0].downvotes(), 1);

        // Started after: the snapshot is authoritative
        let after = shared.begin_fetch();
        shared.apply_snapshot(after, vec![base]);
        let state = shared.state.read();
        assert!(state.pending.is_empty());
        assert_eq!(state.posts, state.snapshot);
    }
}
