//! Comment thread: a post's comments, newest first.
//!
//! Order is insertion order with new comments prepended; it is never
//! re-sorted from timestamps.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{Comment, Identity, Post};
use crate::error::InteractionError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentThread(Vec<Comment>);

impl CommentThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap comments that are already ordered newest first
    pub fn from_newest_first(comments: Vec<Comment>) -> Self {
        Self(comments)
    }

    pub fn prepend(&mut self, comment: Comment) {
        self.0.insert(0, comment);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Comment> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&Comment> {
        self.0.first()
    }

    pub fn contains(&self, comment_id: Uuid) -> bool {
        self.0.iter().any(|c| c.id == comment_id)
    }

    /// Comments by the same author with identical text
    pub fn count_equivalent(&self, comment: &Comment) -> usize {
        self.0
            .iter()
            .filter(|c| c.author_id == comment.author_id && c.content == comment.content)
            .count()
    }
}

impl<'a> IntoIterator for &'a CommentThread {
    type Item = &'a Comment;
    type IntoIter = std::slice::Iter<'a, Comment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Build a comment for the signed-in caller with a fresh id and timestamp
pub fn new_comment(identity: Option<&Identity>, text: &str) -> Result<Comment, InteractionError> {
    let identity = identity.ok_or(InteractionError::AuthenticationRequired)?;
    if text.trim().is_empty() {
        return Err(InteractionError::Validation(
            "Please write something before submitting.".to_string(),
        ));
    }

    Ok(Comment {
        id: Uuid::new_v4(),
        content: text.to_string(),
        author: identity.display_name.clone(),
        author_id: identity.user_id.clone(),
        created_at: Utc::now(),
    })
}

/// Add a comment to `post` and return the updated post. The comment goes first.
pub fn add_comment(
    post: &Post,
    identity: Option<&Identity>,
    text: &str,
) -> Result<Post, InteractionError> {
    let comment = new_comment(identity, text)?;
    let mut updated = post.clone();
    updated.comments.prepend(comment);
    Ok(updated)
}
