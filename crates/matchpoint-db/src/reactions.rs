//! Reaction store. One mutation entry point: an idempotent toggle, so clients
//! never track add/remove state and races collapse to a deterministic outcome.

use rusqlite::params;
use uuid::Uuid;

use matchpoint_types::models::Reaction;

use crate::conversations::is_active_participant;
use crate::error::{Result, StoreError, is_unique_violation};
use crate::messages::load_message;
use crate::models::RawReaction;
use crate::{Database, now_str};

/// Outcome of `toggle_reaction`, with the owning conversation for event
/// fan-out.
#[derive(Debug, Clone, Copy)]
pub struct ReactionToggle {
    pub added: bool,
    pub conversation_id: i64,
}

impl Database {
    /// Toggle a `(message, user, type)` reaction: removes it if present,
    /// records it otherwise. Applying the toggle twice with the same
    /// arguments restores the original state.
    pub fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: Uuid,
        reaction_type: &str,
    ) -> Result<ReactionToggle> {
        let reaction_type = reaction_type.trim();
        if reaction_type.is_empty() {
            return Err(StoreError::Validation("reaction type is empty".into()));
        }

        self.with_tx(|tx| {
            let msg = load_message(tx, message_id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

            let uid = user_id.to_string();
            if !is_active_participant(tx, msg.conversation_id, &uid)? {
                return Err(StoreError::Authorization(format!(
                    "user {user_id} is not an active participant of conversation {}",
                    msg.conversation_id
                )));
            }

            let removed = tx.execute(
                "DELETE FROM message_reactions
                 WHERE message_id = ?1 AND user_id = ?2 AND reaction_type = ?3",
                params![message_id, uid, reaction_type],
            )?;
            if removed > 0 {
                return Ok(ReactionToggle {
                    added: false,
                    conversation_id: msg.conversation_id,
                });
            }

            match tx.execute(
                "INSERT INTO message_reactions (message_id, user_id, reaction_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, uid, reaction_type, now_str()],
            ) {
                Ok(_) => Ok(ReactionToggle {
                    added: true,
                    conversation_id: msg.conversation_id,
                }),
                // A concurrent toggle inserted first. Resolve to the remove
                // half so two racing calls never both report "added".
                Err(e) if is_unique_violation(&e) => {
                    tx.execute(
                        "DELETE FROM message_reactions
                         WHERE message_id = ?1 AND user_id = ?2 AND reaction_type = ?3",
                        params![message_id, uid, reaction_type],
                    )?;
                    Ok(ReactionToggle {
                        added: false,
                        conversation_id: msg.conversation_id,
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Batch-fetch reactions for a page of messages.
    pub fn reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "SELECT message_id, user_id, reaction_type, created_at
                 FROM message_reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params_vec: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let raws = stmt
                .query_map(params_vec.as_slice(), |row| {
                    Ok(RawReaction {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        reaction_type: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            raws.into_iter().map(RawReaction::into_reaction).collect()
        })
    }
}
