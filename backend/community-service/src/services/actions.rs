//! User-triggered vote, comment and post actions.
//!
//! Each action walks `Idle -> Validating -> (Rejected | OptimisticApplied)
//! -> (Confirmed | Reverted)`. Optimistic changes go through the view's
//! [`FeedHandle`] so later snapshots carry them forward until the store has
//! them; a remote failure rolls the change back, and so does dropping the
//! action before the store answers.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{new_comment, NewComment, NewPost, Post, VoteDirection};
use crate::error::InteractionError;
use crate::repository::PostStore;
use crate::services::identity::IdentityProvider;
use crate::services::notifier::{Notifier, Toast};
use crate::services::sync::FeedHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Idle,
    Validating,
    Rejected,
    OptimisticApplied,
    Confirmed,
    Reverted,
}

impl ActionState {
    pub fn can_advance_to(self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Rejected)
                | (Validating, OptimisticApplied)
                | (OptimisticApplied, Confirmed)
                | (OptimisticApplied, Reverted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Rejected | ActionState::Confirmed | ActionState::Reverted
        )
    }
}

impl From<&InteractionError> for ActionState {
    /// Terminal state an action ends in when it fails with `err`
    fn from(err: &InteractionError) -> Self {
        if err.is_rejection() {
            ActionState::Rejected
        } else {
            ActionState::Reverted
        }
    }
}

/// Successful action: the terminal state and the post as the view now shows it
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub state: ActionState,
    pub post: Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ActionKey {
    Vote(Uuid),
    Comment(Uuid),
    CreatePost,
}

struct ActionRun {
    kind: &'static str,
    state: ActionState,
}

impl ActionRun {
    fn start(kind: &'static str) -> Self {
        let mut run = Self {
            kind,
            state: ActionState::Idle,
        };
        run.advance(ActionState::Validating);
        run
    }

    fn advance(&mut self, next: ActionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal action transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(action = self.kind, from = ?self.state, to = ?next, "Action state");
        self.state = next;
    }

    fn reject(&mut self, err: InteractionError) -> InteractionError {
        self.advance(ActionState::Rejected);
        warn!(action = self.kind, reason = %err, "Action rejected");
        err
    }
}

/// Removes the in-flight marker when the action finishes, however it ends
struct InFlight<'a> {
    keys: &'a Mutex<HashSet<ActionKey>>,
    key: ActionKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}

pub struct InteractionActions {
    store: Arc<dyn PostStore>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    feed: FeedHandle,
    in_flight: Mutex<HashSet<ActionKey>>,
}

impl InteractionActions {
    pub fn new(
        store: Arc<dyn PostStore>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
        feed: FeedHandle,
    ) -> Self {
        Self {
            store,
            identity,
            notifier,
            feed,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn feed(&self) -> &FeedHandle {
        &self.feed
    }

    fn claim(&self, key: ActionKey) -> Result<InFlight<'_>, InteractionError> {
        if !self.in_flight.lock().insert(key) {
            return Err(InteractionError::AlreadyPending);
        }
        Ok(InFlight {
            keys: &self.in_flight,
            key,
        })
    }

    fn current_post(&self, post_id: Uuid) -> Result<Post, InteractionError> {
        self.feed
            .post(post_id)
            .ok_or(InteractionError::PostNotFound(post_id))
    }

    /// Toggle the caller's vote on a post
    pub async fn vote(
        &self,
        post_id: Uuid,
        direction: VoteDirection,
    ) -> Result<ActionOutcome, InteractionError> {
        let mut run = ActionRun::start("vote");

        let Some(identity) = self.identity.current_identity() else {
            self.notifier.notify(Toast::destructive(
                "Authentication Required",
                "You need to sign in to vote on posts.",
            ));
            return Err(run.reject(InteractionError::AuthenticationRequired));
        };
        let _guard = self
            .claim(ActionKey::Vote(post_id))
            .map_err(|e| run.reject(e))?;
        let edit = self
            .feed
            .begin_vote(post_id, &identity.user_id, direction)
            .map_err(|e| run.reject(e))?;
        run.advance(ActionState::OptimisticApplied);

        match self
            .store
            .cast_vote(post_id, &identity.user_id, direction)
            .await
        {
            Ok(()) => {
                edit.confirm();
                run.advance(ActionState::Confirmed);
                info!(post_id = %post_id, user_id = %identity.user_id, direction = %direction, "Vote recorded");
                self.notifier.notify(Toast::info(
                    "Vote registered",
                    format!("Your {} has been recorded.", direction),
                ));
                Ok(ActionOutcome {
                    state: run.state,
                    post: self.current_post(post_id)?,
                })
            }
            Err(e) => {
                edit.rollback();
                run.advance(ActionState::Reverted);
                warn!(post_id = %post_id, error = %e, "Vote failed, rolled back");
                self.notifier.notify(Toast::destructive(
                    "Error",
                    format!("Failed to {} post. Please try again.", direction),
                ));
                Err(InteractionError::Remote(e))
            }
        }
    }

    /// Add a comment from the caller to a post
    pub async fn comment(
        &self,
        post_id: Uuid,
        text: &str,
    ) -> Result<ActionOutcome, InteractionError> {
        let mut run = ActionRun::start("comment");

        let identity = self.identity.current_identity();
        let comment = match new_comment(identity.as_ref(), text) {
            Ok(comment) => comment,
            Err(err) => {
                match &err {
                    InteractionError::AuthenticationRequired => {
                        self.notifier.notify(Toast::destructive(
                            "Authentication Required",
                            "You need to sign in to comment.",
                        ))
                    }
                    InteractionError::Validation(message) => self
                        .notifier
                        .notify(Toast::destructive("Empty Comment", message.clone())),
                    _ => {}
                }
                return Err(run.reject(err));
            }
        };
        let _guard = self
            .claim(ActionKey::Comment(post_id))
            .map_err(|e| run.reject(e))?;
        let edit = self
            .feed
            .begin_comment(post_id, comment.clone())
            .map_err(|e| run.reject(e))?;
        run.advance(ActionState::OptimisticApplied);

        match self
            .store
            .add_comment(post_id, NewComment::from(&comment))
            .await
        {
            Ok(stored) => {
                info!(post_id = %post_id, comment_id = %stored.id, "Comment added");
                edit.confirm_comment(stored);
                run.advance(ActionState::Confirmed);
                self.notifier.notify(Toast::info(
                    "Comment Added",
                    "Your comment has been posted successfully.",
                ));
                Ok(ActionOutcome {
                    state: run.state,
                    post: self.current_post(post_id)?,
                })
            }
            Err(e) => {
                edit.rollback();
                run.advance(ActionState::Reverted);
                warn!(post_id = %post_id, error = %e, "Comment failed, rolled back");
                self.notifier.notify(Toast::destructive(
                    "Error",
                    "Failed to add comment. Please try again.",
                ));
                Err(InteractionError::Remote(e))
            }
        }
    }

    /// Publish a new post. A blank title becomes the untitled sentinel.
    pub async fn create_post(
        &self,
        title: Option<&str>,
        content: &str,
    ) -> Result<ActionOutcome, InteractionError> {
        let mut run = ActionRun::start("create_post");

        let identity = self.identity.current_identity();
        let draft = match NewPost::for_identity(identity.as_ref(), title, content) {
            Ok(draft) => draft,
            Err(err) => {
                match &err {
                    InteractionError::AuthenticationRequired => {
                        self.notifier.notify(Toast::destructive(
                            "Authentication Required",
                            "You need to sign in to create a post.",
                        ))
                    }
                    InteractionError::Validation(message) => self
                        .notifier
                        .notify(Toast::destructive("Validation Error", message.clone())),
                    _ => {}
                }
                return Err(run.reject(err));
            }
        };
        let _guard = self
            .claim(ActionKey::CreatePost)
            .map_err(|e| run.reject(e))?;
        let edit = self.feed.begin_post(Post::provisional(&draft));
        run.advance(ActionState::OptimisticApplied);

        match self.store.create_post(draft).await {
            Ok(stored) => {
                info!(post_id = %stored.id, author_id = %stored.author_id, "Post published");
                edit.confirm_post(stored.clone());
                run.advance(ActionState::Confirmed);
                self.notifier.notify(Toast::info(
                    "Success!",
                    "Your post has been published and is now visible to all community members.",
                ));
                Ok(ActionOutcome {
                    state: run.state,
                    post: stored,
                })
            }
            Err(e) => {
                edit.rollback();
                run.advance(ActionState::Reverted);
                warn!(error = %e, "Post creation failed, rolled back");
                self.notifier.notify(Toast::destructive(
                    "Error",
                    "Failed to create post. Please try again.",
                ));
                Err(InteractionError::Remote(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ActionState::*;
        assert!(Idle.can_advance_to(Validating));
        assert!(Validating.can_advance_to(Rejected));
        assert!(OptimisticApplied.can_advance_to(Reverted));
        assert!(!Idle.can_advance_to(Confirmed));
        assert!(!Rejected.can_advance_to(OptimisticApplied));
        assert!(!Confirmed.can_advance_to(Reverted));
    }

    #[test]
    fn test_terminal_state_from_error() {
        assert_eq!(
            ActionState::from(&InteractionError::AuthenticationRequired),
            ActionState::Rejected
        );
        assert_eq!(
            ActionState::from(&InteractionError::Remote(
                crate::error::StoreError::Unavailable("down".into())
            )),
            ActionState::Reverted
        );
        assert!(ActionState::Reverted.is_terminal());
        assert!(!ActionState::OptimisticApplied.is_terminal());
    }
}
