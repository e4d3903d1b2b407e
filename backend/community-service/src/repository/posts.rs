use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use change_feed::{ChangeAction, ChangeEvent, ChangePublisher, ChangeTable};

use super::PostStore;
use crate::domain::{
    Comment, CommentThread, NewComment, NewPost, Post, VoteDirection, VoteLedger,
};
use crate::error::{StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    title: String,
    content: String,
    author: String,
    author_id: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    post_id: Uuid,
    content: String,
    author: String,
    author_id: String,
    created_at: DateTime<Utc>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Comment {
            id: row.id,
            content: row.content,
            author: row.author,
            author_id: row.author_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    post_id: Uuid,
    user_id: String,
    vote_type: String,
}

/// Posts, comments and votes in Postgres.
///
/// Each successful mutation is announced on the change channel when a
/// publisher is configured.
#[derive(Clone)]
pub struct PgPostStore {
    pool: PgPool,
    publisher: Option<ChangePublisher>,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            publisher: None,
        }
    }

    pub fn with_publisher(pool: PgPool, publisher: ChangePublisher) -> Self {
        Self {
            pool,
            publisher: Some(publisher),
        }
    }

    async fn announce(
        &self,
        table: ChangeTable,
        action: ChangeAction,
        record_id: Uuid,
        scope: Option<Uuid>,
    ) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let mut event = ChangeEvent::new(table, action, Some(record_id), publisher.source());
        if let Some(scope) = scope {
            event = event.with_scope(scope.to_string());
        }

        // The row is already committed; subscribers catch up on the next change.
        if let Err(e) = publisher.publish(event).await {
            warn!(table = %table, record_id = %record_id, error = %e, "Failed to publish change event");
        }
    }
}

/// Group comment and vote rows under their posts.
///
/// `posts` and `comments` arrive newest first and keep that order.
fn assemble_posts(
    posts: Vec<PostRow>,
    comments: Vec<CommentRow>,
    votes: Vec<VoteRow>,
) -> StoreResult<Vec<Post>> {
    let mut comments_by_post: HashMap<Uuid, Vec<Comment>> = HashMap::new();
    for row in comments {
        comments_by_post
            .entry(row.post_id)
            .or_default()
            .push(row.into());
    }

    let mut votes_by_post: HashMap<Uuid, Vec<(String, VoteDirection)>> = HashMap::new();
    for row in votes {
        let direction = row
            .vote_type
            .parse::<VoteDirection>()
            .map_err(StoreError::InvalidPayload)?;
        votes_by_post
            .entry(row.post_id)
            .or_default()
            .push((row.user_id, direction));
    }

    posts
        .into_iter()
        .map(|row| -> StoreResult<Post> {
            let votes = VoteLedger::from_votes(votes_by_post.remove(&row.id).unwrap_or_default())?;
            let comments =
                CommentThread::from_newest_first(comments_by_post.remove(&row.id).unwrap_or_default());
            Ok(Post {
                id: row.id,
                title: row.title,
                content: row.content,
                author: row.author,
                author_id: row.author_id,
                created_at: row.created_at,
                votes,
                comments,
            })
        })
        .collect()
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn fetch_all_posts(&self) -> StoreResult<Vec<Post>> {
        let posts = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT id, title, content, author, author_id, created_at
            FROM posts
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let comments = sqlx::query_as::<_, CommentRow>(
            r#"
            SELECT id, post_id, content, author, author_id, created_at
            FROM comments
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let votes = sqlx::query_as::<_, VoteRow>(
            r#"
            SELECT post_id, user_id, vote_type
            FROM post_votes
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(
            posts = posts.len(),
            comments = comments.len(),
            votes = votes.len(),
            "Fetched post collection"
        );

        assemble_posts(posts, comments, votes)
    }

    async fn create_post(&self, post: NewPost) -> StoreResult<Post> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            INSERT INTO posts (title, content, author, author_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, title, content, author, author_id, created_at
            "#,
        )
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.author)
        .bind(&post.author_id)
        .fetch_one(&self.pool)
        .await?;

        let created = assemble_posts(vec![row], Vec::new(), Vec::new())?
            .pop()
            .ok_or_else(|| StoreError::InvalidPayload("insert returned no post".to_string()))?;

        self.announce(ChangeTable::Posts, ChangeAction::Insert, created.id, None)
            .await;
        Ok(created)
    }

    async fn cast_vote(
        &self,
        post_id: Uuid,
        user_id: &str,
        direction: VoteDirection,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // Locking the post row serializes votes on it, including first votes
        // for which no vote row exists yet.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM posts WHERE id = $1 FOR UPDATE")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("post {}", post_id)));
        }

        let current: Option<String> = sqlx::query_scalar(
            "SELECT vote_type FROM post_votes WHERE post_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current = current
            .map(|v| v.parse::<VoteDirection>().map_err(StoreError::InvalidPayload))
            .transpose()?;

        let action = match current {
            Some(existing) if existing == direction => {
                sqlx::query("DELETE FROM post_votes WHERE post_id = $1 AND user_id = $2")
                    .bind(post_id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                ChangeAction::Delete
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE post_votes SET vote_type = $3 WHERE post_id = $1 AND user_id = $2",
                )
                .bind(post_id)
                .bind(user_id)
                .bind(direction.as_str())
                .execute(&mut *tx)
                .await?;
                ChangeAction::Update
            }
            None => {
                sqlx::query(
                    "INSERT INTO post_votes (post_id, user_id, vote_type) VALUES ($1, $2, $3)",
                )
                .bind(post_id)
                .bind(user_id)
                .bind(direction.as_str())
                .execute(&mut *tx)
                .await?;
                ChangeAction::Insert
            }
        };

        tx.commit().await?;

        debug!(post_id = %post_id, user_id = %user_id, action = ?action, "Vote applied");
        self.announce(ChangeTable::PostVotes, action, post_id, None)
            .await;
        Ok(())
    }

    async fn add_comment(&self, post_id: Uuid, comment: NewComment) -> StoreResult<Comment> {
        let row = sqlx::query_as::<_, CommentRow>(
            r#"
            INSERT INTO comments (post_id, content, author, author_id)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM posts WHERE id = $1)
            RETURNING id, post_id, content, author, author_id, created_at
            "#,
        )
        .bind(post_id)
        .bind(&comment.content)
        .bind(&comment.author)
        .bind(&comment.author_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("post {}", post_id)))?;

        let stored = Comment::from(row);
        self.announce(
            ChangeTable::Comments,
            ChangeAction::Insert,
            stored.id,
            Some(post_id),
        )
        .await;
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_row(id: Uuid) -> PostRow {
        PostRow {
            id,
            title: "t".into(),
            content: "c".into(),
            author: "Ada".into(),
            author_id: "a".into(),
            created_at: Utc::now(),
        }
    }

    fn comment_row(post_id: Uuid, content: &str) -> CommentRow {
        CommentRow {
            id: Uuid::new_v4(),
            post_id,
            content: content.into(),
            author: "Cy".into(),
            author_id: "c".into(),
            created_at: Utc::now(),
        }
    }

    fn vote_row(post_id: Uuid, user_id: &str, vote_type: &str) -> VoteRow {
        VoteRow {
            post_id,
            user_id: user_id.into(),
            vote_type: vote_type.into(),
        }
    }

    #[test]
    fn test_assemble_groups_rows_per_post() {
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let posts = assemble_posts(
            vec![post_row(p1), post_row(p2)],
            vec![
                comment_row(p2, "newest"),
                comment_row(p1, "only"),
                comment_row(p2, "oldest"),
            ],
            vec![
                vote_row(p1, "u1", "upvote"),
                vote_row(p1, "u2", "downvote"),
                vote_row(p2, "u1", "upvote"),
            ],
        )
        .unwrap();

        assert_eq!(posts[0].id, p1);
        assert_eq!(posts[0].upvotes(), 1);
        assert_eq!(posts[0].downvotes(), 1);
        assert_eq!(posts[0].comment_count(), 1);

        let texts: Vec<&str> = posts[1].comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["newest", "oldest"]);
    }

    #[test]
    fn test_assemble_rejects_unknown_vote_type() {
        let id = Uuid::new_v4();
        let err = assemble_posts(vec![post_row(id)], vec![], vec![vote_row(id, "u", "meh")])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }

    #[test]
    fn test_assemble_rejects_double_vote() {
        let id = Uuid::new_v4();
        let err = assemble_posts(
            vec![post_row(id)],
            vec![],
            vec![vote_row(id, "u", "upvote"), vote_row(id, "u", "downvote")],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload(_)));
    }
}
