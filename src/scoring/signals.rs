//! Content-analysis collaborator: question counting, emotion, memories

use serde_json::{json, Value};
use std::time::Duration;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::model::{Emotion, SideSignals, Speaker, Turn};

/// Black-box provider of conversation signals.
///
/// `Ok(None)` means the source is not configured; the signal is absent.
pub trait ContentAnalyzer: Send + Sync {
    fn user_initiated_questions(&self, conversation_id: &str, turns: &[Turn])
        -> Result<Option<u32>>;

    fn session_emotion(&self, conversation_id: &str, turns: &[Turn]) -> Result<Option<Emotion>>;

    fn new_memories_count(&self, conversation_id: &str, turns: &[Turn]) -> Result<Option<u32>>;
}

/// Analyzer with every source disabled
pub struct NoopAnalyzer;

impl ContentAnalyzer for NoopAnalyzer {
    fn user_initiated_questions(&self, _: &str, _: &[Turn]) -> Result<Option<u32>> {
        Ok(None)
    }

    fn session_emotion(&self, _: &str, _: &[Turn]) -> Result<Option<Emotion>> {
        Ok(None)
    }

    fn new_memories_count(&self, _: &str, _: &[Turn]) -> Result<Option<u32>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal<T> {
    Value(T),
    Failed,
    Absent,
}

impl<T> Signal<T> {
    fn from_result(result: Result<Option<T>>, name: &str, conversation_id: &str) -> Self {
        match result {
            Ok(Some(v)) => Signal::Value(v),
            Ok(None) => Signal::Absent,
            Err(e) => {
                tracing::warn!(conversation_id, signal = name, error = %e, "content analysis failed, using default");
                Signal::Failed
            }
        }
    }

    /// Fresh value wins, then the caller's value, then `on_failure` if the source failed
    fn resolve(self, provided: Option<T>, on_failure: T) -> Option<T> {
        match self {
            Signal::Value(v) => Some(v),
            Signal::Failed => provided.or(Some(on_failure)),
            Signal::Absent => provided,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub questions: Signal<u32>,
    pub emotion: Signal<Emotion>,
    pub memories: Signal<u32>,
}

impl Analysis {
    pub fn resolve(self, provided: &SideSignals) -> SideSignals {
        SideSignals {
            user_initiated_questions: self
                .questions
                .resolve(provided.user_initiated_questions, 0),
            session_emotion: self
                .emotion
                .resolve(provided.session_emotion, Emotion::Neutral),
            new_memories_count: self.memories.resolve(provided.new_memories_count, 0),
        }
    }
}

/// Run the three independent signals in parallel
pub fn analyze(analyzer: &dyn ContentAnalyzer, conversation_id: &str, turns: &[Turn]) -> Analysis {
    std::thread::scope(|s| {
        let questions = s.spawn(|| analyzer.user_initiated_questions(conversation_id, turns));
        let emotion = s.spawn(|| analyzer.session_emotion(conversation_id, turns));
        let memories = s.spawn(|| analyzer.new_memories_count(conversation_id, turns));

        Analysis {
            questions: Signal::from_result(join(questions), "questions", conversation_id),
            emotion: Signal::from_result(join(emotion), "emotion", conversation_id),
            memories: Signal::from_result(join(memories), "memories", conversation_id),
        }
    })
}

fn join<T>(handle: std::thread::ScopedJoinHandle<'_, Result<Option<T>>>) -> Result<Option<T>> {
    handle
        .join()
        .unwrap_or_else(|_| Err(Error::Analysis("analysis thread panicked".to_string())))
}

// ============================================
// HTTP ANALYZER
// ============================================

/// Posts the conversation to one endpoint per signal
pub struct HttpContentAnalyzer {
    agent: ureq::Agent,
    questions_url: Option<String>,
    emotion_url: Option<String>,
    memories_url: Option<String>,
}

impl HttpContentAnalyzer {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            questions_url: config.questions_url.clone(),
            emotion_url: config.emotion_url.clone(),
            memories_url: config.memories_url.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.questions_url.is_some() || self.emotion_url.is_some() || self.memories_url.is_some()
    }

    fn post(&self, url: &str, conversation_id: &str, turns: &[Turn]) -> Result<Value> {
        let body = json!({
            "conversation_id": conversation_id,
            "conversation": format_conversation(turns),
            "turns": turns,
        });
        match self.agent.post(url).send_json(body) {
            Ok(resp) => resp
                .into_json::<Value>()
                .map_err(|e| Error::Analysis(format!("{}: invalid response body: {}", url, e))),
            Err(ureq::Error::Status(code, _)) => Err(Error::Analysis(format!(
                "{}: http status {}",
                url, code
            ))),
            Err(ureq::Error::Transport(t)) => {
                Err(Error::Analysis(format!("{}: transport error: {}", url, t)))
            }
        }
    }
}

impl ContentAnalyzer for HttpContentAnalyzer {
    fn user_initiated_questions(&self, conversation_id: &str, turns: &[Turn]) -> Result<Option<u32>> {
        let Some(url) = self.questions_url.as_deref() else {
            return Ok(None);
        };
        let data = self.post(url, conversation_id, turns)?;
        Ok(Some(read_count(&data, "user_initiated_questions")))
    }

    fn session_emotion(&self, conversation_id: &str, turns: &[Turn]) -> Result<Option<Emotion>> {
        let Some(url) = self.emotion_url.as_deref() else {
            return Ok(None);
        };
        let data = self.post(url, conversation_id, turns)?;
        let raw = data
            .get("session_emotion")
            .and_then(Value::as_str)
            .unwrap_or("neutral");
        Ok(Some(Emotion::parse_lenient(raw)))
    }

    fn new_memories_count(&self, conversation_id: &str, turns: &[Turn]) -> Result<Option<u32>> {
        let Some(url) = self.memories_url.as_deref() else {
            return Ok(None);
        };
        let data = self.post(url, conversation_id, turns)?;
        let count = match data.get("memories").and_then(Value::as_array) {
            Some(items) => u32::try_from(items.len()).unwrap_or(u32::MAX),
            None => read_count(&data, "new_memories_count"),
        };
        Ok(Some(count))
    }
}

/// Non-negative integer field; anything else counts as zero
fn read_count(data: &Value, field: &str) -> u32 {
    data.get(field)
        .and_then(Value::as_i64)
        .map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// "User: ..." / "Companion: ..." lines
pub fn format_conversation(turns: &[Turn]) -> String {
    turns
        .iter()
        .filter(|t| !t.text.trim().is_empty())
        .map(|t| {
            let who = match t.speaker {
                Speaker::User => "User",
                Speaker::Companion => "Companion",
            };
            format!("{}: {}", who, t.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
