//! Tab views over the post collection.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::models::Post;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tab {
    #[default]
    AllPosts,
    TrendingPost,
    Discussions,
    MediaPics,
}

impl Tab {
    pub const ALL: [Tab; 4] = [
        Tab::AllPosts,
        Tab::TrendingPost,
        Tab::Discussions,
        Tab::MediaPics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tab::AllPosts => "all-posts",
            Tab::TrendingPost => "trending-post",
            Tab::Discussions => "discussions",
            Tab::MediaPics => "media-pics",
        }
    }
}

impl std::fmt::Display for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tab::ALL
            .into_iter()
            .find(|tab| tab.as_str() == s)
            .ok_or_else(|| format!("unknown tab: {}", s))
    }
}

/// Ordered view of `posts` for `tab`. Never mutates the input.
///
/// Sorts are stable, so ties keep the order the store delivered.
/// `MediaPics` returns the collection unchanged: posts carry no media field.
pub fn select_view(posts: &[Post], tab: Tab) -> Vec<Post> {
    let mut view = posts.to_vec();
    match tab {
        Tab::AllPosts | Tab::MediaPics => {}
        Tab::TrendingPost => {
            view.sort_by_key(|p| std::cmp::Reverse(p.upvotes() + p.comment_count()))
        }
        Tab::Discussions => view.sort_by_key(|p| std::cmp::Reverse(p.comment_count())),
    }
    view
}
