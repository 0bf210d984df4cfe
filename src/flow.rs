//! Guided questionnaire: a per-user walk over a fixed list of questions that
//! ends with a generated summary of the collected answers.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::RwLock;

use crate::error::ServiceError;
use crate::openai::{Prompt, TextGenerator};

/// Leading character of every command token.
pub const COMMAND_PREFIX: char = '/';

/// Identifies whose session a message belongs to: one user in one chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub chat_id: i64,
    pub user_id: u64,
}

impl SessionKey {
    pub fn new(chat_id: i64, user_id: u64) -> Self {
        Self { chat_id, user_id }
    }
}

/// Rendered as `"chat:user"`, the key format of the persisted session map.
impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.user_id)
    }
}

impl FromStr for SessionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chat, user) = s
            .split_once(':')
            .ok_or_else(|| format!("missing ':' in session key {:?}", s))?;
        let chat_id = chat
            .parse()
            .map_err(|e| format!("bad chat id in {:?}: {}", s, e))?;
        let user_id = user
            .parse()
            .map_err(|e| format!("bad user id in {:?}: {}", s, e))?;
        Ok(Self { chat_id, user_id })
    }
}

/// Index of a question awaiting an answer. Only a [`Questionnaire`] hands these
/// out, so a `Step` is always within its bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Step(usize);

impl Step {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered, non-empty list of questions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Questionnaire {
    questions: Vec<String>,
}

impl Questionnaire {
    /// Returns `None` for an empty list.
    pub fn new(questions: Vec<String>) -> Option<Self> {
        if questions.is_empty() {
            None
        } else {
            Some(Self { questions })
        }
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> Step {
        Step(0)
    }

    pub fn step(&self, index: usize) -> Option<Step> {
        (index < self.questions.len()).then_some(Step(index))
    }

    pub fn next(&self, step: Step) -> Option<Step> {
        self.step(step.0 + 1)
    }

    pub fn question(&self, step: Step) -> &str {
        &self.questions[step.0]
    }

    pub fn questions(&self) -> &[String] {
        &self.questions
    }
}

/// Where a user is in the questionnaire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingAnswer(Step),
    Complete,
}

/// In-progress answers of one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    step: Step,
    answers: Vec<String>,
}

impl Session {
    fn start(questionnaire: &Questionnaire) -> Self {
        Self {
            step: questionnaire.first(),
            answers: Vec::with_capacity(questionnaire.len()),
        }
    }

    /// Rebuild a session from persisted parts, rejecting anything that breaks
    /// `answers.len() == current_step < N`.
    pub fn restore(
        questionnaire: &Questionnaire,
        current_step: usize,
        answers: Vec<String>,
    ) -> Option<Self> {
        let step = questionnaire.step(current_step)?;
        if answers.len() != current_step {
            return None;
        }
        Some(Self { step, answers })
    }

    pub fn current_step(&self) -> Step {
        self.step
    }

    pub fn answers(&self) -> &[String] {
        &self.answers
    }

    pub fn into_answers(self) -> Vec<String> {
        self.answers
    }

    /// Append an answer for the current step and move on.
    fn record(&mut self, questionnaire: &Questionnaire, answer: String) -> FlowState {
        self.answers.push(answer);
        match questionnaire.next(self.step) {
            Some(next) => {
                self.step = next;
                FlowState::AwaitingAnswer(next)
            }
            None => FlowState::Complete,
        }
    }
}

/// On-disk form of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub current_step: usize,
    pub answers: Vec<String>,
}

/// Load a persisted session map; a missing or unreadable file yields an empty map.
pub fn load_sessions(path: &Path) -> HashMap<String, PersistedSession> {
    if !path.exists() {
        return HashMap::new();
    }
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!("failed to parse {}: {}. Starting with no sessions.", path.display(), e);
            HashMap::new()
        }),
        Err(e) => {
            tracing::warn!("failed to read {}: {}. Starting with no sessions.", path.display(), e);
            HashMap::new()
        }
    }
}

/// Save the session map to the given path as pretty JSON
pub fn save_sessions(path: &Path, map: &HashMap<String, PersistedSession>) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(map) {
        Ok(s) => {
            if let Err(e) = fs::write(path, s) {
                tracing::warn!("failed to write {}: {}", path.display(), e);
            }
        }
        Err(e) => tracing::warn!("failed to serialize sessions: {}", e),
    }
}

/// Owns every user's session. Optionally mirrors itself to a JSON file after
/// each mutation so an in-progress questionnaire survives a restart.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<SessionKey, Session>,
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load sessions from `path` (dropping invalid entries) and persist back to it.
    pub fn persistent(path: PathBuf, questionnaire: &Questionnaire) -> Self {
        let mut sessions = HashMap::new();
        for (key, stored) in load_sessions(&path) {
            let parsed = match key.parse::<SessionKey>() {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!("dropping persisted session: {}", e);
                    continue;
                }
            };
            match Session::restore(questionnaire, stored.current_step, stored.answers) {
                Some(session) => {
                    sessions.insert(parsed, session);
                }
                None => tracing::warn!(
                    "dropping persisted session {}: step {} does not fit the questionnaire",
                    key,
                    stored.current_step
                ),
            }
        }
        tracing::info!("restored {} sessions from {}", sessions.len(), path.display());
        Self {
            sessions,
            path: Some(path),
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn insert(&mut self, key: SessionKey, session: Session) {
        self.sessions.insert(key, session);
        self.persist();
    }

    fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        let removed = self.sessions.remove(key);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    fn snapshot(&self) -> HashMap<String, PersistedSession> {
        self.sessions
            .iter()
            .map(|(k, s)| {
                (
                    k.to_string(),
                    PersistedSession {
                        current_step: s.step.index(),
                        answers: s.answers.clone(),
                    },
                )
            })
            .collect()
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            save_sessions(path, &self.snapshot());
        }
    }
}

/// User-visible strings used by the engine.
#[derive(Clone, Debug)]
pub struct FlowTexts {
    /// Shown when a command arrives mid-questionnaire; `{question}` is replaced.
    pub reprompt: String,
    pub cancelled: String,
    pub nothing_in_progress: String,
    pub summary_fallback: String,
    /// System prompt for summary generation.
    pub persona: String,
    pub summary_instruction: String,
}

#[derive(Clone, Debug)]
pub struct FlowConfig {
    pub questionnaire: Questionnaire,
    /// Command names without the prefix, e.g. `yearcompass`.
    pub begin_command: String,
    pub cancel_command: String,
    pub texts: FlowTexts,
    pub summary_temperature: f32,
    pub summary_max_tokens: u32,
}

/// What a single message in the flow should produce.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    /// Ask the question at `step`.
    Question { step: Step, text: String },
    /// A command arrived mid-questionnaire; ask the same question again.
    Reprompt { step: Step, text: String },
    /// The questionnaire finished; `fallback` is set when generation failed.
    Summary { text: String, fallback: bool },
    Cancelled(String),
    /// Nothing is in progress for this user; the message was not consumed.
    NoActiveSession(String),
}

impl OutboundMessage {
    pub fn text(&self) -> &str {
        match self {
            OutboundMessage::Question { text, .. }
            | OutboundMessage::Reprompt { text, .. }
            | OutboundMessage::Summary { text, .. } => text,
            OutboundMessage::Cancelled(text) | OutboundMessage::NoActiveSession(text) => text,
        }
    }
}

/// A recognized command token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Begin,
    Cancel,
    Other(&'a str),
}

/// Name of the command `text` starts with, without the prefix and any
/// `@botname` suffix. `None` for free text.
pub fn command_name(text: &str) -> Option<&str> {
    let token = text.split_whitespace().next()?;
    let name = token.strip_prefix(COMMAND_PREFIX)?;
    Some(name.split('@').next().unwrap_or(name))
}

/// Classify `text` against the begin and cancel command names (case-insensitive).
pub fn parse_command<'a>(text: &'a str, begin: &str, cancel: &str) -> Option<Command<'a>> {
    let name = command_name(text)?;
    if name.eq_ignore_ascii_case(begin) {
        Some(Command::Begin)
    } else if name.eq_ignore_ascii_case(cancel) {
        Some(Command::Cancel)
    } else {
        Some(Command::Other(name))
    }
}

/// Render answers as numbered question/answer pairs for the summary request.
pub fn format_answers(questionnaire: &Questionnaire, answers: &[String]) -> String {
    questionnaire
        .questions()
        .iter()
        .zip(answers)
        .enumerate()
        .map(|(i, (q, a))| format!("{}. {}\n{}", i + 1, q, a))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct FlowEngine {
    config: FlowConfig,
    store: RwLock<SessionStore>,
    summarizer: Arc<dyn TextGenerator>,
}

impl FlowEngine {
    pub fn new(config: FlowConfig, store: SessionStore, summarizer: Arc<dyn TextGenerator>) -> Self {
        Self {
            config,
            store: RwLock::new(store),
            summarizer,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub async fn state(&self, key: SessionKey) -> FlowState {
        match self.store.read().await.get(&key) {
            Some(session) => FlowState::AwaitingAnswer(session.current_step()),
            None => FlowState::Idle,
        }
    }

    pub async fn session(&self, key: SessionKey) -> Option<Session> {
        self.store.read().await.get(&key).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.store.read().await.len()
    }

    /// Single entry point for every text message: handles the begin and cancel
    /// commands, re-prompts on other commands and records free text as the
    /// answer to the current question.
    pub async fn submit_answer(&self, key: SessionKey, text: &str) -> OutboundMessage {
        let command = parse_command(
            text,
            &self.config.begin_command,
            &self.config.cancel_command,
        );
        match command {
            Some(Command::Begin) => self.begin(key).await,
            Some(Command::Cancel) => self.cancel(key).await,
            Some(Command::Other(name)) => self.reprompt(key, name).await,
            None => self.answer(key, text).await,
        }
    }

    /// Start (or restart) the questionnaire for `key`.
    pub async fn begin(&self, key: SessionKey) -> OutboundMessage {
        let questionnaire = &self.config.questionnaire;
        let mut store = self.store.write().await;
        let restarted = store.get(&key).is_some();
        store.insert(key, Session::start(questionnaire));
        drop(store);
        tracing::info!("flow begin: key={} restarted={}", key, restarted);
        let step = questionnaire.first();
        OutboundMessage::Question {
            step,
            text: questionnaire.question(step).to_string(),
        }
    }

    /// Discard any session for `key`. Acknowledges even when nothing was active.
    pub async fn cancel(&self, key: SessionKey) -> OutboundMessage {
        let removed = self.store.write().await.remove(&key);
        if let Some(session) = removed {
            tracing::info!(
                "flow cancelled: key={} at step {}",
                key,
                session.current_step().index()
            );
        }
        OutboundMessage::Cancelled(self.config.texts.cancelled.clone())
    }

    async fn reprompt(&self, key: SessionKey, command: &str) -> OutboundMessage {
        let step = match self.store.read().await.get(&key) {
            Some(session) => session.current_step(),
            None => return self.no_active_session(),
        };
        tracing::debug!("flow reprompt: key={} command={}", key, command);
        let question = self.config.questionnaire.question(step);
        OutboundMessage::Reprompt {
            step,
            text: crate::format_with(&self.config.texts.reprompt, &[("question", question)]),
        }
    }

    async fn answer(&self, key: SessionKey, text: &str) -> OutboundMessage {
        let questionnaire = &self.config.questionnaire;
        let mut store = self.store.write().await;
        let Some(session) = store.sessions.get_mut(&key) else {
            return self.no_active_session();
        };
        let completed = match session.record(questionnaire, text.trim().to_string()) {
            FlowState::AwaitingAnswer(next) => {
                store.persist();
                return OutboundMessage::Question {
                    step: next,
                    text: questionnaire.question(next).to_string(),
                };
            }
            _ => store.remove(&key),
        };
        drop(store);

        let answers = completed.map(Session::into_answers).unwrap_or_default();
        tracing::info!("flow complete: key={} answers={}", key, answers.len());
        let (text, fallback) = self.summary_or_fallback(&answers).await;
        OutboundMessage::Summary { text, fallback }
    }

    /// Build the summary request for a completed set of answers.
    pub fn summary_prompt(&self, answers: &[String]) -> Prompt {
        let texts = &self.config.texts;
        Prompt {
            system: texts.persona.clone(),
            user: format!(
                "{}\n\n{}",
                texts.summary_instruction,
                format_answers(&self.config.questionnaire, answers)
            ),
            temperature: self.config.summary_temperature,
            max_tokens: self.config.summary_max_tokens,
        }
    }

    /// Ask the text generator for a summary; errors are returned untouched.
    pub async fn request_summary(&self, answers: &[String]) -> Result<String, ServiceError> {
        self.summarizer.complete(&self.summary_prompt(answers)).await
    }

    /// Summary text for `answers`, or the fallback text if generation fails.
    pub async fn generate_summary(&self, answers: &[String]) -> String {
        self.summary_or_fallback(answers).await.0
    }

    // the flag is true when the fallback text was used
    async fn summary_or_fallback(&self, answers: &[String]) -> (String, bool) {
        match self.request_summary(answers).await {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(
                    "summary generation failed (timeout: {}): {}",
                    e.is_timeout(),
                    e
                );
                (self.config.texts.summary_fallback.clone(), true)
            }
        }
    }

    fn no_active_session(&self) -> OutboundMessage {
        OutboundMessage::NoActiveSession(self.config.texts.nothing_in_progress.clone())
    }
}
