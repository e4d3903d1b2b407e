pub mod actions;
pub mod identity;
pub mod messaging;
pub mod notifier;
pub mod resources;
pub mod sync;

pub use actions::{ActionOutcome, ActionState, InteractionActions};
pub use identity::{IdentityProvider, StaticIdentity};
pub use messaging::{ConversationWatch, MessageWatch, MessagingService};
pub use notifier::{Notifier, RecordingNotifier, Severity, Toast, TracingNotifier};
pub use resources::{Book, BookArchiveClient, ResourceBrowser};
pub use sync::{EditGuard, FeedHandle, FeedSynchronizer, PendingEdit, SyncConfig, SyncStatus};
