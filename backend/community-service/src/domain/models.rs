use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::ledger::{VoteLedger, VoteTransition};
use super::thread::CommentThread;
use crate::error::InteractionError;

/// Title stored when the author leaves the title blank. Views treat it as "no title".
pub const UNTITLED_POST_TITLE: &str = "New Post";

/// Display name used when the identity provider has neither a first name nor a username
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

/// Signed-in caller as supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Build an identity from a provider profile: first name, else username, else "Anonymous"
    pub fn from_profile(
        user_id: impl Into<String>,
        first_name: Option<&str>,
        username: Option<&str>,
    ) -> Self {
        let display_name = [first_name, username]
            .into_iter()
            .flatten()
            .find(|name| !name.is_empty())
            .unwrap_or(ANONYMOUS_DISPLAY_NAME);
        Self::new(user_id, display_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Upvote,
    Downvote,
}

impl VoteDirection {
    pub fn opposite(self) -> Self {
        match self {
            VoteDirection::Upvote => VoteDirection::Downvote,
            VoteDirection::Downvote => VoteDirection::Upvote,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Upvote => "upvote",
            VoteDirection::Downvote => "downvote",
        }
    }
}

impl std::fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upvote" => Ok(VoteDirection::Upvote),
            "downvote" => Ok(VoteDirection::Downvote),
            other => Err(format!("unknown vote type: {}", other)),
        }
    }
}

/// Comment on a post. Never edited or deleted once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub content: String,
    pub author: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

/// Post aggregate: content metadata plus its vote ledger and comment thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub author: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub votes: VoteLedger,
    pub comments: CommentThread,
}

impl Post {
    /// Materialize a stored post from a validated draft
    pub fn from_draft(draft: NewPost, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: draft.title,
            content: draft.content,
            author: draft.author,
            author_id: draft.author_id,
            created_at,
            votes: VoteLedger::default(),
            comments: CommentThread::default(),
        }
    }

    /// Local stand-in shown until the store assigns the real id and timestamp
    pub fn provisional(draft: &NewPost) -> Self {
        Self::from_draft(draft.clone(), Uuid::new_v4(), Utc::now())
    }

    /// Title to render, `None` when the post carries the untitled sentinel
    pub fn display_title(&self) -> Option<&str> {
        if self.title == UNTITLED_POST_TITLE {
            None
        } else {
            Some(&self.title)
        }
    }

    pub fn upvotes(&self) -> usize {
        self.votes.upvotes()
    }

    pub fn downvotes(&self) -> usize {
        self.votes.downvotes()
    }

    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }

    /// Apply the toggle/switch vote rules for `user_id`
    pub fn cast_vote(&mut self, user_id: &str, direction: VoteDirection) -> VoteTransition {
        self.votes.cast(user_id, direction)
    }

    /// Same author, title and body; used to recognise an optimistic post in a snapshot
    pub fn same_submission(&self, other: &Post) -> bool {
        self.author_id == other.author_id
            && self.title == other.title
            && self.content == other.content
    }
}

/// Validated post fields sent to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub title: String,
    pub content: String,
    pub author: String,
    pub author_id: String,
}

impl NewPost {
    /// Validate a post submission for the signed-in caller
    pub fn for_identity(
        identity: Option<&Identity>,
        title: Option<&str>,
        content: &str,
    ) -> Result<Self, InteractionError> {
        let identity = identity.ok_or(InteractionError::AuthenticationRequired)?;
        create_post(&identity.user_id, &identity.display_name, title, content)
    }
}

/// Validated comment fields sent to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub content: String,
    pub author: String,
    pub author_id: String,
}

impl From<&Comment> for NewComment {
    fn from(comment: &Comment) -> Self {
        Self {
            content: comment.content.clone(),
            author: comment.author.clone(),
            author_id: comment.author_id.clone(),
        }
    }
}

/// Build the draft of a new post.
///
/// Content must be non-blank; it is kept as typed. A missing or blank title
/// becomes [`UNTITLED_POST_TITLE`]. Id and timestamp are assigned by the store.
pub fn create_post(
    author_id: &str,
    author_name: &str,
    title: Option<&str>,
    content: &str,
) -> Result<NewPost, InteractionError> {
    if author_id.is_empty() {
        return Err(InteractionError::AuthenticationRequired);
    }
    if content.trim().is_empty() {
        return Err(InteractionError::Validation(
            "Post content is required.".to_string(),
        ));
    }

    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED_POST_TITLE);

    Ok(NewPost {
        title: title.to_string(),
        content: content.to_string(),
        author: author_name.to_string(),
        author_id: author_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_post_defaults_title() {
        let draft = create_post("user_u", "Uma", None, "Hello world").unwrap();
        assert_eq!(draft.title, UNTITLED_POST_TITLE);
        assert_eq!(draft.content, "Hello world");
        assert_eq!(draft.author, "Uma");
        assert_eq!(draft.author_id, "user_u");
    }

    #[test]
    fn test_create_post_blank_title_is_untitled() {
        let draft = create_post("user_u", "Uma", Some("   "), "body").unwrap();
        assert_eq!(draft.title, UNTITLED_POST_TITLE);

        let draft = create_post("user_u", "Uma", Some("  Study tips "), "body").unwrap();
        assert_eq!(draft.title, "Study tips");
    }

    #[test]
    fn test_create_post_rejects_blank_content() {
        let err = create_post("user_u", "Uma", Some("title"), " \n\t ").unwrap_err();
        assert!(matches!(err, InteractionError::Validation(_)));
    }

    #[test]
    fn test_create_post_keeps_content_as_typed() {
        let draft = create_post("user_u", "Uma", None, "  spaced  ").unwrap();
        assert_eq!(draft.content, "  spaced  ");
    }

    #[test]
    fn test_for_identity_requires_sign_in() {
        let err = NewPost::for_identity(None, None, "Hello").unwrap_err();
        assert!(matches!(err, InteractionError::AuthenticationRequired));
    }

    #[test]
    fn test_fresh_post_has_no_votes_or_comments() {
        let draft = create_post("user_u", "Uma", None, "Hello world").unwrap();
        let post = Post::from_draft(draft, Uuid::new_v4(), Utc::now());
        assert_eq!(post.upvotes(), 0);
        assert_eq!(post.downvotes(), 0);
        assert_eq!(post.comment_count(), 0);
        assert_eq!(post.display_title(), None);
    }

    #[test]
    fn test_display_title_for_real_title() {
        let draft = create_post("user_u", "Uma", Some("Exam prep"), "Hello").unwrap();
        let post = Post::provisional(&draft);
        assert_eq!(post.display_title(), Some("Exam prep"));
    }

    #[test]
    fn test_identity_display_name_fallbacks() {
        assert_eq!(
            Identity::from_profile("u1", Some("Uma"), Some("uma99")).display_name,
            "Uma"
        );
        assert_eq!(
            Identity::from_profile("u1", Some(""), Some("uma99")).display_name,
            "uma99"
        );
        assert_eq!(
            Identity::from_profile("u1", None, None).display_name,
            ANONYMOUS_DISPLAY_NAME
        );
    }

    #[test]
    fn test_vote_direction_parsing() {
        assert_eq!("upvote".parse::<VoteDirection>(), Ok(VoteDirection::Upvote));
        assert_eq!(
            "downvote".parse::<VoteDirection>(),
            Ok(VoteDirection::Downvote)
        );
        assert!("sideways".parse::<VoteDirection>().is_err());
        assert_eq!(VoteDirection::Upvote.opposite(), VoteDirection::Downvote);
    }
}
