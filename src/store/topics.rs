//! Agent to topic routing

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::model::FriendshipLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentTopic {
    pub agent_id: String,
    /// `None` applies to every level
    pub friendship_level: Option<FriendshipLevel>,
    pub topic_id: String,
}

pub struct TopicDirectory<'c> {
    conn: &'c Connection,
}

impl<'c> TopicDirectory<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Topic for an agent at a level; a level-specific mapping wins
    pub fn resolve(&self, agent_id: &str, level: FriendshipLevel) -> Result<Option<String>> {
        let topic = self
            .conn
            .query_row(
                "SELECT topic_id FROM agent_topics
                 WHERE agent_id = ?1 AND friendship_level IN (?2, '')
                 ORDER BY friendship_level = '' ASC
                 LIMIT 1",
                params![agent_id, level.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(topic)
    }

    pub fn set(
        &self,
        agent_id: &str,
        level: Option<FriendshipLevel>,
        topic_id: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agent_topics (agent_id, friendship_level, topic_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, friendship_level) DO UPDATE SET topic_id = excluded.topic_id",
            params![agent_id, level.map(|l| l.as_str()).unwrap_or(""), topic_id],
        )?;
        Ok(())
    }

    pub fn remove(&self, agent_id: &str, level: Option<FriendshipLevel>) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM agent_topics WHERE agent_id = ?1 AND friendship_level = ?2",
            params![agent_id, level.map(|l| l.as_str()).unwrap_or("")],
        )?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> Result<Vec<AgentTopic>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, friendship_level, topic_id FROM agent_topics
             ORDER BY agent_id, friendship_level",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(agent_id, level, topic_id)| -> Result<AgentTopic> {
                let friendship_level = if level.is_empty() {
                    None
                } else {
                    Some(level.parse()?)
                };
                Ok(AgentTopic {
                    agent_id,
                    friendship_level,
                    topic_id,
                })
            })
            .collect()
    }
}
