//! Vote ledger: which users voted which way on a post.
//!
//! Counts are derived from the two user sets, so `upvotes == |upvoted_by|`
//! and `downvotes == |downvoted_by|` hold by construction. Every mutation
//! goes through [`VoteLedger::cast`] or [`VoteLedger::set_vote`], both of
//! which keep a user in at most one of the sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use super::models::{Identity, Post, VoteDirection};
use crate::error::InteractionError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("user {0} appears in both upvotedBy and downvotedBy")]
    ConflictingVotes(String),

    #[error("{direction} count {count} does not match {voters} voters")]
    CountMismatch {
        direction: VoteDirection,
        count: usize,
        voters: usize,
    },
}

/// Result of a single vote action, from the voter's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteTransition {
    Added(VoteDirection),
    Removed(VoteDirection),
    Switched {
        from: VoteDirection,
        to: VoteDirection,
    },
}

impl VoteTransition {
    /// The voter's vote after the transition
    pub fn resulting_vote(&self) -> Option<VoteDirection> {
        match self {
            VoteTransition::Added(d) => Some(*d),
            VoteTransition::Removed(_) => None,
            VoteTransition::Switched { to, .. } => Some(*to),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LedgerWire", into = "LedgerWire")]
pub struct VoteLedger {
    upvoted_by: BTreeSet<String>,
    downvoted_by: BTreeSet<String>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from stored `(user, direction)` rows
    pub fn from_votes<I, S>(votes: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = (S, VoteDirection)>,
        S: Into<String>,
    {
        let mut ledger = Self::default();
        for (user, direction) in votes {
            let user = user.into();
            if ledger.set(direction.opposite()).contains(&user) {
                return Err(LedgerError::ConflictingVotes(user));
            }
            ledger.set_mut(direction).insert(user);
        }
        Ok(ledger)
    }

    pub fn upvotes(&self) -> usize {
        self.upvoted_by.len()
    }

    pub fn downvotes(&self) -> usize {
        self.downvoted_by.len()
    }

    pub fn upvoted_by(&self) -> &BTreeSet<String> {
        &self.upvoted_by
    }

    pub fn downvoted_by(&self) -> &BTreeSet<String> {
        &self.downvoted_by
    }

    pub fn vote_of(&self, user_id: &str) -> Option<VoteDirection> {
        if self.upvoted_by.contains(user_id) {
            Some(VoteDirection::Upvote)
        } else if self.downvoted_by.contains(user_id) {
            Some(VoteDirection::Downvote)
        } else {
            None
        }
    }

    /// Toggle/switch state machine for one user:
    /// same direction again removes the vote, the opposite direction moves it,
    /// otherwise the vote is added.
    pub fn cast(&mut self, user_id: &str, direction: VoteDirection) -> VoteTransition {
        match self.vote_of(user_id) {
            Some(current) if current == direction => {
                self.set_mut(direction).remove(user_id);
                VoteTransition::Removed(direction)
            }
            Some(current) => {
                self.set_mut(current).remove(user_id);
                self.set_mut(direction).insert(user_id.to_string());
                VoteTransition::Switched {
                    from: current,
                    to: direction,
                }
            }
            None => {
                self.set_mut(direction).insert(user_id.to_string());
                VoteTransition::Added(direction)
            }
        }
    }

    /// Force the user's vote to `vote` regardless of the current state.
    /// Idempotent, unlike [`VoteLedger::cast`].
    pub fn set_vote(&mut self, user_id: &str, vote: Option<VoteDirection>) {
        self.upvoted_by.remove(user_id);
        self.downvoted_by.remove(user_id);
        if let Some(direction) = vote {
            self.set_mut(direction).insert(user_id.to_string());
        }
    }

    fn set(&self, direction: VoteDirection) -> &BTreeSet<String> {
        match direction {
            VoteDirection::Upvote => &self.upvoted_by,
            VoteDirection::Downvote => &self.downvoted_by,
        }
    }

    fn set_mut(&mut self, direction: VoteDirection) -> &mut BTreeSet<String> {
        match direction {
            VoteDirection::Upvote => &mut self.upvoted_by,
            VoteDirection::Downvote => &mut self.downvoted_by,
        }
    }
}

/// Wire shape: denormalized counts next to the voter lists
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerWire {
    upvotes: usize,
    downvotes: usize,
    upvoted_by: Vec<String>,
    downvoted_by: Vec<String>,
}

impl From<VoteLedger> for LedgerWire {
    fn from(ledger: VoteLedger) -> Self {
        Self {
            upvotes: ledger.upvotes(),
            downvotes: ledger.downvotes(),
            upvoted_by: ledger.upvoted_by.into_iter().collect(),
            downvoted_by: ledger.downvoted_by.into_iter().collect(),
        }
    }
}

impl TryFrom<LedgerWire> for VoteLedger {
    type Error = LedgerError;

    fn try_from(wire: LedgerWire) -> Result<Self, Self::Error> {
        let ledger = VoteLedger::from_votes(
            wire.upvoted_by
                .into_iter()
                .map(|u| (u, VoteDirection::Upvote))
                .chain(
                    wire.downvoted_by
                        .into_iter()
                        .map(|u| (u, VoteDirection::Downvote)),
                ),
        )?;

        for (direction, count, voters) in [
            (VoteDirection::Upvote, wire.upvotes, ledger.upvotes()),
            (VoteDirection::Downvote, wire.downvotes, ledger.downvotes()),
        ] {
            if count != voters {
                return Err(LedgerError::CountMismatch {
                    direction,
                    count,
                    voters,
                });
            }
        }

        Ok(ledger)
    }
}

/// Cast a vote on behalf of the signed-in caller and return the updated post.
///
/// Without an identity the vote is rejected and `post` is left untouched.
pub fn cast_vote(
    post: &Post,
    identity: Option<&Identity>,
    direction: VoteDirection,
) -> Result<Post, InteractionError> {
    let identity = identity.ok_or(InteractionError::AuthenticationRequired)?;
    let mut updated = post.clone();
    updated.cast_vote(&identity.user_id, direction);
    Ok(updated)
}
