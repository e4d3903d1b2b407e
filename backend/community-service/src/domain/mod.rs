pub mod ledger;
pub mod messages;
pub mod models;
pub mod tabs;
pub mod thread;

pub use ledger::{cast_vote, LedgerError, VoteLedger, VoteTransition};
pub use messages::{Conversation, ConversationParticipant, ConversationThread, Message};
pub use models::{
    create_post, Comment, Identity, NewComment, NewPost, Post, VoteDirection,
    ANONYMOUS_DISPLAY_NAME, UNTITLED_POST_TITLE,
};
pub use tabs::{select_view, Tab};
pub use thread::{add_comment, new_comment, CommentThread};
