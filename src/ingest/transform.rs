//! Conversation log normalisation
//!
//! Upstream sends logs either as standard turns (`speaker`/`text`) or in the
//! API shape `{"character": "BOT_RESPONSE_CONVERSATION", "content": "..."}`.
//! Both end up as `Vec<Turn>`.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Speaker, Turn};

/// Result of normalising an incoming log
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLog {
    pub turns: Vec<Turn>,
    /// True when the input was in API format and had to be rewritten
    pub transformed: bool,
}

/// Parse `value` into turns, rewriting API-format items when needed
pub fn normalize_log(
    value: &Value,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<NormalizedLog> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::Validation("conversation_log must be an array".to_string()))?;

    if is_api_format(items) {
        return Ok(NormalizedLog {
            turns: transform_api_log(items, start_time, end_time),
            transformed: true,
        });
    }

    let turns: Vec<Turn> = serde_json::from_value(value.clone())
        .map_err(|e| Error::Validation(format!("invalid conversation_log: {}", e)))?;
    Ok(NormalizedLog {
        turns,
        transformed: false,
    })
}

/// API format is detected from the first item carrying `character` and `content`
pub fn is_api_format(items: &[Value]) -> bool {
    match items.first().and_then(Value::as_object) {
        Some(first) => {
            first.contains_key("character")
                && first.contains_key("content")
                && !first.contains_key("speaker")
        }
        None => false,
    }
}

fn transform_api_log(
    items: &[Value],
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Vec<Turn> {
    let total = i64::try_from(items.len()).unwrap_or(i64::MAX);
    let duration_secs = (end_time - start_time).num_seconds().max(0);
    let mut turns = Vec::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        let content = item
            .get("content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            tracing::debug!(index, "skipping empty log item");
            continue;
        }

        let character = item
            .get("character")
            .and_then(Value::as_str)
            .unwrap_or_default();

        // Spread over the session using the original index, skipped items included
        let offset = if total > 1 {
            let index = i64::try_from(index).unwrap_or(i64::MAX);
            duration_secs.saturating_mul(index) / total
        } else {
            0
        };

        turns.push(Turn {
            speaker: speaker_for_character(character),
            text: content.to_string(),
            timestamp: Some(start_time + Duration::seconds(offset)),
            turn_id: Some(u32::try_from(turns.len()).unwrap_or(u32::MAX).saturating_add(1)),
        });
    }

    tracing::debug!(
        items = items.len(),
        turns = turns.len(),
        "normalised API-format conversation log"
    );
    turns
}

/// Map an API `character` tag to a speaker; unknown tags count as the companion
pub fn speaker_for_character(character: &str) -> Speaker {
    let tag = character.trim().to_ascii_uppercase();
    if tag.contains("BOT") || tag.contains("PIKA") || tag.contains("COMPANION") {
        Speaker::Companion
    } else if tag.contains("USER") {
        Speaker::User
    } else {
        tracing::warn!(character, "unknown character type, treating as companion");
        Speaker::Companion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        (start, start + Duration::seconds(400))
    }

    #[test]
    fn test_api_format_is_transformed() {
        let (start, end) = window();
        let log = json!([
            {"character": "BOT_RESPONSE_CONVERSATION", "content": "Hello!"},
            {"character": "USER_RESPONSE_CONVERSATION", "content": " Hi there! "},
            {"character": "BOT_RESPONSE_CONVERSATION", "content": "   "},
            {"character": "user_response_conversation", "content": "Bye"},
        ]);

        let normalized = normalize_log(&log, start, end).unwrap();
        assert!(normalized.transformed);
        let turns = normalized.turns;
        assert_eq!(turns.len(), 3);

        assert_eq!(turns[0].speaker, Speaker::Companion);
        assert_eq!(turns[0].turn_id, Some(1));
        assert_eq!(turns[0].timestamp, Some(start));

        assert_eq!(turns[1].speaker, Speaker::User);
        assert_eq!(turns[1].text, "Hi there!");
        assert_eq!(turns[1].timestamp, Some(start + Duration::seconds(100)));

        // Blank item dropped, ids stay dense, timestamps keep the source index
        assert_eq!(turns[2].speaker, Speaker::User);
        assert_eq!(turns[2].turn_id, Some(3));
        assert_eq!(turns[2].timestamp, Some(start + Duration::seconds(300)));
    }

    #[test]
    fn test_standard_format_passes_through() {
        let (start, end) = window();
        let log = json!([
            {"speaker": "pika", "text": "What did you watch?"},
            {"speaker": "user", "text": "A space movie", "turn_id": 2},
        ]);

        let normalized = normalize_log(&log, start, end).unwrap();
        assert!(!normalized.transformed);
        assert_eq!(normalized.turns[0].speaker, Speaker::Companion);
        assert_eq!(normalized.turns[0].timestamp, None);
        assert_eq!(normalized.turns[1].turn_id, Some(2));
    }

    #[test]
    fn test_rejects_non_array_and_bad_turns() {
        let (start, end) = window();
        let err = normalize_log(&json!({"speaker": "user"}), start, end).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = normalize_log(&json!([{"speaker": "narrator", "text": "x"}]), start, end)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_empty_log_is_allowed() {
        let (start, end) = window();
        let normalized = normalize_log(&json!([]), start, end).unwrap();
        assert!(normalized.turns.is_empty());
        assert!(!normalized.transformed);
    }

    #[test]
    fn test_character_mapping() {
        assert_eq!(speaker_for_character("BOT_RESPONSE_CONVERSATION"), Speaker::Companion);
        assert_eq!(speaker_for_character(" pika "), Speaker::Companion);
        assert_eq!(speaker_for_character("USER_RESPONSE_CONVERSATION"), Speaker::User);
        assert_eq!(speaker_for_character("SYSTEM"), Speaker::Companion);
    }
}
