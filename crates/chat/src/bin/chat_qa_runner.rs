use std::env;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};

use helpdesk_chat::{ChatError, ChatSession, ChatSettings, ReconcileOutcome, SettingsStore, Viewer};
use helpdesk_storage::{
    ConversationStore, FeedHub, Gateway, MemoryGateway, MessageOrder, MessageStore, NewMessage,
    SenderKind, SqliteGateway, StorageError, UserId,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    in_memory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
    Memory,
    Sqlite(String),
}

impl Backend {
    /// `--memory` wins, then `--db`, then the configured database location.
    fn select(args: &RunnerArgs, settings: &ChatSettings) -> Self {
        if args.in_memory {
            return Self::Memory;
        }
        Self::Sqlite(
            args.db_path
                .clone()
                .unwrap_or_else(|| settings.database_location.clone()),
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    FirstContact,
    ReopenSameConversation,
    SendAndRemoteReply,
    TeardownIsolation,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "first_contact" => Some(Self::FirstContact),
            "reopen_same_conversation" => Some(Self::ReopenSameConversation),
            "send_and_remote_reply" => Some(Self::SendAndRemoteReply),
            "teardown_isolation" => Some(Self::TeardownIsolation),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::FirstContact => "first_contact",
            Self::ReopenSameConversation => "reopen_same_conversation",
            Self::SendAndRemoteReply => "send_and_remote_reply",
            Self::TeardownIsolation => "teardown_isolation",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage call failed: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat call failed: {source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let settings = SettingsStore::load().settings();
    let gateway = open_gateway(Backend::select(&args, &settings), &settings).await?;

    match args.scenario {
        Scenario::FirstContact => run_first_contact(&gateway, &settings).await?,
        Scenario::ReopenSameConversation => run_reopen_same_conversation(&gateway, &settings).await?,
        Scenario::SendAndRemoteReply => run_send_and_remote_reply(&gateway, &settings).await?,
        Scenario::TeardownIsolation => run_teardown_isolation(&gateway, &settings).await?,
        Scenario::All => {
            run_first_contact(&gateway, &settings).await?;
            run_reopen_same_conversation(&gateway, &settings).await?;
            run_send_and_remote_reply(&gateway, &settings).await?;
            run_teardown_isolation(&gateway, &settings).await?;
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut in_memory = false;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--memory" => in_memory = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        in_memory,
    })
}

async fn open_gateway(backend: Backend, settings: &ChatSettings) -> RunnerResult<Arc<dyn Gateway>> {
    match backend {
        Backend::Sqlite(db_path) => {
            println!("backend=sqlite");
            println!("db_path={db_path}");
            let feed = FeedHub::new(settings.feed_capacity);
            let gateway = SqliteGateway::open_with_feed(&db_path, feed)
                .await
                .context(StorageSnafu {
                    stage: "open-sqlite-gateway",
                })?;
            Ok(Arc::new(gateway))
        }
        Backend::Memory => {
            println!("backend=memory");
            Ok(Arc::new(MemoryGateway::with_feed_capacity(
                settings.feed_capacity,
            )))
        }
    }
}

fn new_session(gateway: &Arc<dyn Gateway>, settings: &Arc<ChatSettings>) -> ChatSession {
    ChatSession::new(gateway.clone(), settings.clone())
}

fn check(condition: bool, scenario: &'static str, reason: impl Into<String>) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.into(),
    }
    .fail()
}

async fn run_first_contact(
    gateway: &Arc<dyn Gateway>,
    settings: &Arc<ChatSettings>,
) -> RunnerResult<()> {
    const SCENARIO: &str = "first_contact";
    let viewer = Viewer::new(UserId::new_v7(), "Ada");
    let mut session = new_session(gateway, settings);

    session.open(viewer).await.context(ChatSnafu {
        stage: "first-contact-open",
    })?;
    session.settle_read_state().await;

    let messages = session.messages();
    println!("first_contact_messages={}", messages.len());
    check(messages.len() == 1, SCENARIO, "expected exactly the greeting")?;

    let greeting = &messages[0];
    println!("first_contact_greeting_sender={}", greeting.sender_name);
    check(
        greeting.sender_kind == SenderKind::Support && greeting.sender_id.is_none(),
        SCENARIO,
        "greeting must come from the system sender",
    )?;
    check(
        greeting.body.contains("Ada"),
        SCENARIO,
        "greeting must address the viewer by name",
    )?;

    let conversation_id = session
        .state()
        .conversation_id()
        .context(ScenarioFailedSnafu {
            stage: "first-contact-ready",
            scenario: SCENARIO,
            reason: "session is not ready".to_string(),
        })?;
    let stored = gateway
        .get_conversation(conversation_id)
        .await
        .context(StorageSnafu {
            stage: "first-contact-get-conversation",
        })?;
    let unread = stored.map(|conversation| conversation.unread_count);
    println!("first_contact_unread={unread:?}");
    check(unread == Some(0), SCENARIO, "opening must clear the unread counter")?;

    session.close();
    Ok(())
}

async fn run_reopen_same_conversation(
    gateway: &Arc<dyn Gateway>,
    settings: &Arc<ChatSettings>,
) -> RunnerResult<()> {
    const SCENARIO: &str = "reopen_same_conversation";
    let viewer = Viewer::new(UserId::new_v7(), "Ada");
    let mut conversation_ids = Vec::new();

    for _ in 0..3 {
        let mut session = new_session(gateway, settings);
        session.open(viewer.clone()).await.context(ChatSnafu {
            stage: "reopen-open",
        })?;
        conversation_ids.extend(session.state().conversation_id());
        session.close();
    }

    conversation_ids.dedup();
    println!("reopen_distinct_conversations={}", conversation_ids.len());
    check(
        conversation_ids.len() == 1,
        SCENARIO,
        "every open must resolve to the same conversation",
    )?;

    let messages = gateway
        .list_messages(conversation_ids[0], MessageOrder::CreatedAscending)
        .await
        .context(StorageSnafu {
            stage: "reopen-list-messages",
        })?;
    println!("reopen_greetings={}", messages.len());
    check(messages.len() == 1, SCENARIO, "greeting must be sent only once")?;
    Ok(())
}

async fn run_send_and_remote_reply(
    gateway: &Arc<dyn Gateway>,
    settings: &Arc<ChatSettings>,
) -> RunnerResult<()> {
    const SCENARIO: &str = "send_and_remote_reply";
    let viewer = Viewer::new(UserId::new_v7(), "Ada");
    let mut session = new_session(gateway, settings);
    session.open(viewer).await.context(ChatSnafu {
        stage: "send-reply-open",
    })?;

    session.set_draft("Hello");
    session.send_draft().await.context(ChatSnafu {
        stage: "send-reply-send",
    })?;
    let echoed = session.drain_feed();
    println!("send_self_echo={echoed:?}");
    check(session.messages().len() == 2, SCENARIO, "own message must appear once")?;

    let conversation_id = session
        .state()
        .conversation_id()
        .context(ScenarioFailedSnafu {
            stage: "send-reply-ready",
            scenario: SCENARIO,
            reason: "session is not ready".to_string(),
        })?;
    gateway
        .insert_message(
            conversation_id,
            NewMessage::from_support(UserId::new_v7(), "Grace", "How can I help?"),
        )
        .await
        .context(StorageSnafu {
            stage: "send-reply-remote-insert",
        })?;

    let outcome = session.next_feed_event().await.context(ChatSnafu {
        stage: "send-reply-next-event",
    })?;
    println!("send_remote_outcome={outcome:?}");
    check(
        outcome == Some(ReconcileOutcome::Appended),
        SCENARIO,
        "remote reply must be appended",
    )?;

    let bodies = session
        .messages()
        .iter()
        .map(|message| message.body.as_str())
        .collect::<Vec<_>>();
    println!("send_timeline_len={}", bodies.len());
    check(
        bodies.len() == 3 && bodies[1] == "Hello" && bodies[2] == "How can I help?",
        SCENARIO,
        format!("unexpected timeline {bodies:?}"),
    )?;

    session.close();
    Ok(())
}

async fn run_teardown_isolation(
    gateway: &Arc<dyn Gateway>,
    settings: &Arc<ChatSettings>,
) -> RunnerResult<()> {
    const SCENARIO: &str = "teardown_isolation";
    let mut session = new_session(gateway, settings);

    session
        .open(Viewer::new(UserId::new_v7(), "Ada"))
        .await
        .context(ChatSnafu {
            stage: "teardown-open-first",
        })?;
    let first_conversation = session
        .state()
        .conversation_id()
        .context(ScenarioFailedSnafu {
            stage: "teardown-first-ready",
            scenario: SCENARIO,
            reason: "first session is not ready".to_string(),
        })?;
    session.close();

    session
        .open(Viewer::new(UserId::new_v7(), "Grace"))
        .await
        .context(ChatSnafu {
            stage: "teardown-open-second",
        })?;

    gateway
        .insert_message(
            first_conversation,
            NewMessage::from_support(UserId::new_v7(), "Linus", "Late reply for Ada"),
        )
        .await
        .context(StorageSnafu {
            stage: "teardown-late-insert",
        })?;
    let leaked = session.drain_feed();

    println!("teardown_leaked_events={}", leaked.len());
    check(leaked.is_empty(), SCENARIO, "closed conversation leaked a live event")?;
    check(
        session
            .messages()
            .iter()
            .all(|message| message.conversation_id != first_conversation),
        SCENARIO,
        "timeline holds rows of the closed conversation",
    )?;

    session.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> RunnerArgs {
        parse_args(raw.iter().map(|arg| arg.to_string())).unwrap()
    }

    fn settings() -> ChatSettings {
        ChatSettings {
            database_location: "/var/lib/helpdesk/chat.db".to_string(),
            ..ChatSettings::default()
        }
    }

    #[test]
    fn configured_database_is_the_default_backend() {
        let backend = Backend::select(&args(&["--scenario", "all"]), &settings());
        assert_eq!(backend, Backend::Sqlite("/var/lib/helpdesk/chat.db".to_string()));
    }

    #[test]
    fn db_flag_overrides_the_configured_location() {
        let backend = Backend::select(
            &args(&["--scenario", "first_contact", "--db", "scratch.db"]),
            &settings(),
        );
        assert_eq!(backend, Backend::Sqlite("scratch.db".to_string()));
    }

    #[test]
    fn memory_flag_skips_sqlite() {
        let backend = Backend::select(
            &args(&["--memory", "--scenario", "first_contact", "--db", "scratch.db"]),
            &settings(),
        );
        assert_eq!(backend, Backend::Memory);
    }

    #[test]
    fn unknown_scenario_is_rejected() {
        let error = parse_args(["--scenario".to_string(), "nope".to_string()]).unwrap_err();
        assert!(matches!(error, RunnerError::UnknownScenario { .. }));
    }
}
