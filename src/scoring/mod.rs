//! Score computation for one finished conversation
//!
//! ```text
//! base       = total_turns               x 1.0
//! engagement = user_initiated_questions  x 3.0
//! emotion    = +15 interesting, -15 boring, 0 otherwise
//! memory     = new_memories_count        x 5.0
//! delta      = max(0, base + engagement + emotion + memory)
//! ```

mod signals;

use std::sync::Arc;

use crate::model::{Emotion, ScoreBreakdown, SideSignals, Speaker, Turn};

pub use signals::{
    analyze, Analysis, ContentAnalyzer, HttpContentAnalyzer, NoopAnalyzer, Signal,
};

pub const BASE_SCORE_PER_TURN: f64 = 1.0;
pub const ENGAGEMENT_PER_QUESTION: f64 = 3.0;
pub const MEMORY_BONUS_PER_ITEM: f64 = 5.0;
pub const EMOTION_BONUS: f64 = 15.0;

/// Number of adjacent companion/user exchanges.
///
/// Each message joins at most one pair; a same-speaker neighbour or a
/// trailing message without a partner does not count.
pub fn count_turns(log: &[Turn]) -> u32 {
    let mut turns = 0u32;
    let mut i = 0;
    while i + 1 < log.len() {
        if log[i].speaker != log[i + 1].speaker {
            turns = turns.saturating_add(1);
            i += 2;
        } else {
            i += 1;
        }
    }
    turns
}

pub fn emotion_bonus(emotion: Emotion) -> f64 {
    match emotion {
        Emotion::Interesting => EMOTION_BONUS,
        Emotion::Boring => -EMOTION_BONUS,
        _ => 0.0,
    }
}

fn count_user_messages(log: &[Turn]) -> u32 {
    let n = log.iter().filter(|t| t.speaker == Speaker::User).count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Apply the formula to fully resolved signals
pub fn score(log: &[Turn], questions: u32, emotion: Emotion, memories: u32) -> ScoreBreakdown {
    let total_turns = count_turns(log);
    let base_score = f64::from(total_turns) * BASE_SCORE_PER_TURN;
    let engagement_bonus = f64::from(questions) * ENGAGEMENT_PER_QUESTION;
    let emotion_bonus = emotion_bonus(emotion);
    let memory_bonus = f64::from(memories) * MEMORY_BONUS_PER_ITEM;
    let raw_total = base_score + engagement_bonus + emotion_bonus + memory_bonus;

    ScoreBreakdown {
        total_turns,
        base_score,
        user_initiated_questions: questions,
        engagement_bonus,
        session_emotion: emotion,
        emotion_bonus,
        new_memories_count: memories,
        memory_bonus,
        raw_total,
        total_exchange_score: raw_total.max(0.0),
        analyzer_invoked: false,
        topic_id: None,
    }
}

#[derive(Clone)]
pub struct ScoreEngine {
    analyzer: Arc<dyn ContentAnalyzer>,
}

impl Default for ScoreEngine {
    fn default() -> Self {
        Self::new(Arc::new(NoopAnalyzer))
    }
}

impl ScoreEngine {
    pub fn new(analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        Self { analyzer }
    }

    /// Score a conversation. The analyzer runs only when the caller did not
    /// already supply a non-neutral emotion and a positive question count.
    pub fn compute(
        &self,
        conversation_id: &str,
        log: &[Turn],
        provided: &SideSignals,
    ) -> (f64, ScoreBreakdown) {
        let (resolved, analyzer_invoked) = if provided.is_complete() {
            (provided.clone(), false)
        } else {
            let analysis = analyze(self.analyzer.as_ref(), conversation_id, log);
            (analysis.resolve(provided), true)
        };

        let questions = resolved
            .user_initiated_questions
            .unwrap_or_else(|| count_user_messages(log));
        let emotion = resolved.session_emotion.unwrap_or_default();
        let memories = resolved.new_memories_count.unwrap_or(0);

        let mut breakdown = score(log, questions, emotion, memories);
        breakdown.analyzer_invoked = analyzer_invoked;

        tracing::debug!(
            conversation_id,
            total_turns = breakdown.total_turns,
            questions,
            emotion = %emotion,
            memories,
            delta = breakdown.total_exchange_score,
            analyzer_invoked,
            "score computed"
        );
        (breakdown.total_exchange_score, breakdown)
    }
}
