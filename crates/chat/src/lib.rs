pub mod error;
pub mod read_state;
pub mod reconciler;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod timeline;

pub use error::{ChatError, ChatResult};
pub use read_state::ReadStateTracker;
pub use reconciler::{LiveReconciler, ReconcileOutcome};
pub use resolver::{ConversationResolver, Resolution, Viewer};
pub use session::{
    ChatSession, ChatState, ChatTransition, ChatTransitionRejection, ChatTransitionResult,
    ComposeState, FeedStatus,
};
pub use settings::{ChatSettings, GreetingSettings, ReconnectSettings, SettingsError, SettingsStore};
pub use timeline::{InsertionOrder, MergeOutcome, MessageTimeline};
