use helpdesk_storage::StorageError;
use snafu::Snafu;

use crate::session::ChatTransitionRejection;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("cannot open a conversation without a signed-in user"))]
    MissingViewer { stage: &'static str },
    #[snafu(display("failed to resolve the open conversation for user '{user_id}': {source}"))]
    ResolveConversation {
        stage: &'static str,
        user_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to load messages for conversation '{conversation_id}': {source}"))]
    LoadMessages {
        stage: &'static str,
        conversation_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to subscribe to conversation '{conversation_id}': {source}"))]
    Subscribe {
        stage: &'static str,
        conversation_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to send message to conversation '{conversation_id}': {source}"))]
    SendMessage {
        stage: &'static str,
        conversation_id: String,
        source: StorageError,
    },
    #[snafu(display("chat is not ready on `{stage}`"))]
    NotReady { stage: &'static str },
    #[snafu(display("illegal chat state transition on `{stage}`: {rejection:?}"))]
    InvalidTransition {
        stage: &'static str,
        rejection: ChatTransitionRejection,
    },
    #[snafu(display(
        "live updates for conversation '{conversation_id}' were lost after {attempts} reconnect attempts"
    ))]
    FeedLost {
        stage: &'static str,
        conversation_id: String,
        attempts: u32,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
