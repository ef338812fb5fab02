use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use rusqlite::types::Value;
use tracing::{debug, error};
use uuid::Uuid;

use retrace_core::error::RetraceError;

use crate::db::{
    integer_column, opt_bool_column, opt_integer_column, opt_text_column, text_column, Database,
    Row, Table,
};

pub const DEFAULT_SESSION_ID: &str = "default";

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One recorded question/answer exchange.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub id: String,
    pub app_id: String,
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub metadata: Metadata,
    pub created_at: String,
    pub was_helpful: Option<bool>,
    pub rating: Option<i64>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub content: String,
    pub metadata: Metadata,
}

/// A turn rendered as its paired human/AI messages.
#[derive(Debug, Clone)]
pub struct TurnMessages {
    pub human: ChatMessage,
    pub ai: ChatMessage,
}

/// History selection. `fetch_all` returns the app's entire history across
/// all sessions; otherwise the named session is paginated.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub session_id: String,
    pub page_number: u32,
    pub page_size: u32,
    pub fetch_all: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        HistoryQuery {
            session_id: DEFAULT_SESSION_ID.to_string(),
            page_number: 1,
            page_size: 10,
            fetch_all: false,
        }
    }
}

impl HistoryQuery {
    pub fn for_session(session_id: &str) -> Self {
        HistoryQuery {
            session_id: session_id.to_string(),
            ..HistoryQuery::default()
        }
    }

    pub fn all_sessions() -> Self {
        HistoryQuery {
            fetch_all: true,
            ..HistoryQuery::default()
        }
    }

    pub fn page(mut self, page_number: u32, page_size: u32) -> Self {
        self.page_number = page_number;
        self.page_size = page_size;
        self
    }
}

#[derive(Clone)]
pub struct ChatHistory {
    db: Arc<Database>,
}

impl ChatHistory {
    pub fn new(db: Arc<Database>) -> Self {
        ChatHistory { db }
    }

    /// Records one turn and returns its generated id. Failures are logged
    /// and surfaced as errors so the caller always knows whether the turn
    /// was persisted.
    pub fn add_turn(
        &self,
        app_id: &str,
        session_id: &str,
        question: &str,
        answer: &str,
        metadata: Option<Metadata>,
    ) -> Result<String, RetraceError> {
        let turn_id = Uuid::new_v4().to_string();
        let metadata_json = serialize_metadata(metadata)?;
        let created_at = Utc::now().to_rfc3339();
        let record = [
            ("app_id", Value::Text(app_id.to_string())),
            ("id", Value::Text(turn_id.clone())),
            ("session_id", Value::Text(session_id.to_string())),
            ("question", Value::Text(question.to_string())),
            ("answer", Value::Text(answer.to_string())),
            ("metadata", Value::Text(metadata_json)),
            ("created_at", Value::Text(created_at)),
        ];
        if let Err(e) = self.db.execute_insert(Table::ChatHistory, &record) {
            error!("failed to record chat turn for app {app_id}: {e}");
            return Err(e);
        }
        debug!("recorded chat turn {turn_id} for app {app_id}");
        Ok(turn_id)
    }

    pub fn delete_history(
        &self,
        app_id: &str,
        session_id: Option<&str>,
    ) -> Result<usize, RetraceError> {
        let removed = match session_id {
            Some(session) => self.db.execute(
                "DELETE FROM chat_history WHERE app_id = ?1 AND session_id = ?2",
                params![app_id, session],
            )?,
            None => self.db.execute(
                "DELETE FROM chat_history WHERE app_id = ?1",
                params![app_id],
            )?,
        };
        debug!("removed {removed} chat turns for app {app_id}");
        Ok(removed)
    }

    /// Full typed turn records, oldest first.
    pub fn get_history(
        &self,
        app_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<ChatTurn>, RetraceError> {
        let rows = if query.fetch_all {
            self.db.query_rows(
                "SELECT app_id, id, session_id, question, answer, metadata,
                        created_at, was_helpful, rating, feedback
                 FROM chat_history
                 WHERE app_id = ?1
                 ORDER BY created_at ASC, id ASC",
                params![app_id],
            )?
        } else {
            let page_number = query.page_number.max(1);
            let offset = i64::from(page_number - 1) * i64::from(query.page_size);
            let limit = i64::from(query.page_size);
            self.db.query_rows(
                "SELECT app_id, id, session_id, question, answer, metadata,
                        created_at, was_helpful, rating, feedback
                 FROM chat_history
                 WHERE app_id = ?1 AND session_id = ?2
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?3 OFFSET ?4",
                params![app_id, query.session_id, limit, offset],
            )?
        };
        rows.iter().map(turn_from_row).collect()
    }

    /// Same selection as [`get_history`](Self::get_history), shaped as
    /// human/AI message pairs carrying the parsed metadata.
    pub fn get_history_messages(
        &self,
        app_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<TurnMessages>, RetraceError> {
        Ok(self
            .get_history(app_id, query)?
            .into_iter()
            .map(|turn| TurnMessages {
                human: ChatMessage {
                    content: turn.question,
                    metadata: turn.metadata.clone(),
                },
                ai: ChatMessage {
                    content: turn.answer,
                    metadata: turn.metadata,
                },
            })
            .collect())
    }

    pub fn count_turns(
        &self,
        app_id: &str,
        session_id: Option<&str>,
    ) -> Result<i64, RetraceError> {
        let rows = match session_id {
            Some(session) => self.db.query_rows(
                "SELECT COUNT(*) AS turn_count FROM chat_history
                 WHERE app_id = ?1 AND session_id = ?2",
                params![app_id, session],
            )?,
            None => self.db.query_rows(
                "SELECT COUNT(*) AS turn_count FROM chat_history WHERE app_id = ?1",
                params![app_id],
            )?,
        };
        match rows.first() {
            Some(row) => integer_column(row, "turn_count"),
            None => Ok(0),
        }
    }

    /// Blind update by turn id; returns whether any row changed. An unknown
    /// id is a no-op, not an error.
    pub fn record_feedback(&self, turn_id: &str, feedback: &str) -> Result<bool, RetraceError> {
        let changed = self.db.execute_update(
            Table::ChatHistory,
            &[("feedback", Value::Text(feedback.to_string()))],
            &[("id", Value::Text(turn_id.to_string()))],
        )?;
        Ok(changed > 0)
    }

    pub fn record_helpfulness(&self, turn_id: &str, flag: bool) -> Result<bool, RetraceError> {
        let changed = self.db.execute_update(
            Table::ChatHistory,
            &[("was_helpful", Value::Integer(i64::from(flag)))],
            &[("id", Value::Text(turn_id.to_string()))],
        )?;
        Ok(changed > 0)
    }

    pub fn record_rating(&self, turn_id: &str, rating: i64) -> Result<bool, RetraceError> {
        let changed = self.db.execute_update(
            Table::ChatHistory,
            &[("rating", Value::Integer(rating))],
            &[("id", Value::Text(turn_id.to_string()))],
        )?;
        Ok(changed > 0)
    }
}

/// Combines per-message metadata into the single blob stored on the turn.
/// AI-side keys win on collision.
pub fn merge_metadata(human: Option<&Metadata>, ai: Option<&Metadata>) -> Option<Metadata> {
    match (human, ai) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (Some(human), Some(ai)) => {
            let mut merged = human.clone();
            for (key, value) in ai {
                merged.insert(key.clone(), value.clone());
            }
            Some(merged)
        }
    }
}

pub(crate) fn serialize_metadata(metadata: Option<Metadata>) -> Result<String, RetraceError> {
    match metadata {
        Some(map) if !map.is_empty() => Ok(serde_json::to_string(&map)?),
        _ => Ok("{}".to_string()),
    }
}

pub(crate) fn parse_metadata(raw: &str) -> Result<Metadata, RetraceError> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn turn_from_row(row: &Row) -> Result<ChatTurn, RetraceError> {
    let metadata = parse_metadata(&text_column(row, "metadata")?)?;
    Ok(ChatTurn {
        id: text_column(row, "id")?,
        app_id: text_column(row, "app_id")?,
        session_id: text_column(row, "session_id")?,
        question: text_column(row, "question")?,
        answer: text_column(row, "answer")?,
        metadata,
        created_at: text_column(row, "created_at")?,
        was_helpful: opt_bool_column(row, "was_helpful")?,
        rating: opt_integer_column(row, "rating")?,
        feedback: opt_text_column(row, "feedback")?,
    })
}
