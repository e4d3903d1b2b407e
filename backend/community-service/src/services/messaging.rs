//! Direct messaging between community members.

use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use change_feed::{ChangeAction, ChangeTable};

use crate::domain::{Conversation, ConversationThread, Identity, Message};
use crate::error::{InteractionError, StoreError, SubscriptionError};
use crate::repository::{ChangeFeed, ChangeStream, MessageStore};
use crate::services::identity::IdentityProvider;
use crate::services::notifier::{Notifier, Toast};

pub struct MessagingService {
    store: Arc<dyn MessageStore>,
    changes: Arc<dyn ChangeFeed>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        changes: Arc<dyn ChangeFeed>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            changes,
            identity,
            notifier,
        }
    }

    fn error_toast(&self, description: &str) {
        self.notifier.notify(Toast::destructive("Error", description));
    }

    fn require_identity(&self) -> Result<Identity, InteractionError> {
        self.identity
            .current_identity()
            .ok_or(InteractionError::AuthenticationRequired)
    }

    async fn open_stream(&self) -> Result<ChangeStream, InteractionError> {
        self.changes.subscribe().await.map_err(|e| {
            warn!(error = %e, "Failed to subscribe to message changes");
            InteractionError::Remote(StoreError::Unavailable(e.to_string()))
        })
    }

    /// The caller's conversations, most recently updated first.
    ///
    /// Signed out or on failure this is empty; failures are also toasted.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let Some(identity) = self.identity.current_identity() else {
            return Vec::new();
        };
        match self.store.conversations_for(&identity.user_id).await {
            Ok(conversations) => conversations,
            Err(e) => {
                error!(user_id = %identity.user_id, error = %e, "Failed to fetch conversations");
                self.error_toast("Failed to fetch conversations");
                Vec::new()
            }
        }
    }

    /// Open the conversation shared with `other_user_id`, creating it if needed
    pub async fn start_conversation(
        &self,
        other_user_id: &str,
    ) -> Result<ConversationThread, InteractionError> {
        let Some(identity) = self.identity.current_identity() else {
            self.error_toast("You must be logged in to start a conversation");
            return Err(InteractionError::AuthenticationRequired);
        };
        if other_user_id.trim().is_empty() || other_user_id == identity.user_id {
            return Err(InteractionError::Validation(
                "Choose another member to message.".to_string(),
            ));
        }

        let existing = self
            .store
            .find_direct_conversation(&identity.user_id, other_user_id)
            .await;
        let conversation = match existing {
            Ok(Some(conversation)) => conversation,
            Ok(None) => self
                .store
                .create_conversation(&identity.user_id, other_user_id)
                .await
                .map_err(|e| self.creation_failed(e))?,
            Err(e) => return Err(self.creation_failed(e)),
        };

        info!(conversation_id = %conversation.id, "Conversation started");
        self.open_conversation(conversation.id).await
    }

    fn creation_failed(&self, e: StoreError) -> InteractionError {
        error!(error = %e, "Failed to create conversation");
        self.error_toast("Failed to create conversation");
        InteractionError::Remote(e)
    }

    /// Load a conversation with its messages and mark the caller's unread ones read
    pub async fn open_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<ConversationThread, InteractionError> {
        let identity = self.require_identity()?;

        let mut thread = match self.store.conversation_with_messages(conversation_id).await {
            Ok(thread) => thread,
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Failed to fetch conversation");
                self.error_toast("Failed to fetch conversation and messages");
                return Err(InteractionError::Remote(e));
            }
        };

        match self.store.mark_read(conversation_id, &identity.user_id).await {
            Ok(_) => {
                for message in thread
                    .messages
                    .iter_mut()
                    .filter(|m| m.sender_id != identity.user_id)
                {
                    message.read = true;
                }
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to mark messages read")
            }
        }

        Ok(thread)
    }

    /// Send a message. Blank content is ignored and yields `Ok(None)`.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Option<Message>, InteractionError> {
        let identity = self.require_identity()?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        match self
            .store
            .send_message(conversation_id, &identity.user_id, content)
            .await
        {
            Ok(message) => {
                debug!(conversation_id = %conversation_id, message_id = %message.id, "Message sent");
                Ok(Some(message))
            }
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Failed to send message");
                self.error_toast("Failed to send message");
                Err(InteractionError::Remote(e))
            }
        }
    }

    /// Follow new messages in one conversation
    pub async fn watch_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<MessageWatch, InteractionError> {
        let identity = self.require_identity()?;
        let changes = self.open_stream().await?;
        Ok(MessageWatch {
            changes,
            store: Arc::clone(&self.store),
            conversation_id,
            scope: conversation_id.to_string(),
            reader_id: identity.user_id,
        })
    }

    /// Follow the caller's conversation list
    pub async fn watch_conversations(&self) -> Result<ConversationWatch, InteractionError> {
        let identity = self.require_identity()?;
        let changes = self.open_stream().await?;
        Ok(ConversationWatch {
            changes,
            store: Arc::clone(&self.store),
            user_id: identity.user_id,
        })
    }
}

/// New messages of one conversation, oldest first.
///
/// Messages from other participants are marked read as they arrive.
/// Dropping the watch unsubscribes.
pub struct MessageWatch {
    changes: ChangeStream,
    store: Arc<dyn MessageStore>,
    conversation_id: Uuid,
    scope: String,
    reader_id: String,
}

impl MessageWatch {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Next incoming message, or `None` once the change stream ends
    pub async fn next(&mut self) -> Option<Message> {
        while let Some(item) = self.changes.next().await {
            let event = match item {
                Ok(event) => event,
                Err(SubscriptionError::Lagged(missed)) => {
                    warn!(missed, conversation_id = %self.conversation_id, "Message stream lagged");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, conversation_id = %self.conversation_id, "Message stream failed");
                    return None;
                }
            };

            if event.table != ChangeTable::Messages
                || event.action != ChangeAction::Insert
                || !event.in_scope(&self.scope)
            {
                continue;
            }
            let Some(message_id) = event.record_id else {
                continue;
            };

            let message = match self.store.get_message(message_id).await {
                Ok(Some(message)) if message.conversation_id == self.conversation_id => message,
                Ok(_) => continue,
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Failed to load incoming message");
                    continue;
                }
            };

            if message.sender_id != self.reader_id {
                if let Err(e) = self
                    .store
                    .mark_read(self.conversation_id, &self.reader_id)
                    .await
                {
                    warn!(conversation_id = %self.conversation_id, error = %e, "Failed to mark messages read");
                }
            }
            return Some(message);
        }
        None
    }
}

/// Refreshed conversation lists, one per relevant change
pub struct ConversationWatch {
    changes: ChangeStream,
    store: Arc<dyn MessageStore>,
    user_id: String,
}

impl ConversationWatch {
    /// Next refreshed list, or `None` once the change stream ends
    pub async fn next(&mut self) -> Option<Vec<Conversation>> {
        while let Some(item) = self.changes.next().await {
            match item {
                Ok(event) if !event.table.affects_conversations() => continue,
                Ok(_) | Err(SubscriptionError::Lagged(_)) => {}
                Err(e) => {
                    warn!(error = %e, "Conversation stream failed");
                    return None;
                }
            }

            match self.store.conversations_for(&self.user_id).await {
                Ok(conversations) => return Some(conversations),
                Err(e) => {
                    error!(user_id = %self.user_id, error = %e, "Failed to refresh conversations")
                }
            }
        }
        None
    }
}
