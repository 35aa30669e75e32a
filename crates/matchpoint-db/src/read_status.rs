//! Read-receipt tracker: write-once per-message read marks and unread-count
//! derivation from the participant's read position.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::conversations::{is_active_participant, touch_last_read_inner};
use crate::error::Result;
use crate::messages::load_message;
use crate::{Database, StoreError, now_str, parse_dt};

/// Outcome of `mark_read`: whether a new receipt was recorded, and the
/// message's conversation for event fan-out.
#[derive(Debug, Clone, Copy)]
pub struct ReadMark {
    pub recorded: bool,
    pub conversation_id: i64,
}

impl Database {
    /// Record that a user read a message. First read wins; `read_at` never
    /// changes afterwards (`INSERT OR IGNORE` over the unique constraint, so
    /// concurrent duplicates collapse to the first writer). Acknowledging a
    /// message also advances the participant's read position to its
    /// `created_at`. Reads from users without active membership are dropped
    /// silently: they are stale deliveries from removed participants.
    pub fn mark_read(&self, message_id: i64, user_id: Uuid) -> Result<ReadMark> {
        self.with_tx(|tx| {
            let msg = load_message(tx, message_id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

            let uid = user_id.to_string();
            if !is_active_participant(tx, msg.conversation_id, &uid)? {
                return Ok(ReadMark {
                    recorded: false,
                    conversation_id: msg.conversation_id,
                });
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO message_read_status (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                params![message_id, uid, now_str()],
            )?;

            touch_last_read_inner(tx, msg.conversation_id, &uid, parse_dt(&msg.created_at)?)?;

            Ok(ReadMark {
                recorded: inserted > 0,
                conversation_id: msg.conversation_id,
            })
        })
    }

    /// Messages the user has not read yet: everything newer than their read
    /// position (all of history when they have never read), excluding their
    /// own messages and removed ones.
    pub fn unread_count(&self, conversation_id: i64, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| unread_count_inner(conn, conversation_id, &user_id.to_string()))
    }
}

pub(crate) fn unread_count_inner(
    conn: &Connection,
    conversation_id: i64,
    user_id: &str,
) -> Result<i64> {
    let membership: Option<Option<String>> = conn
        .query_row(
            "SELECT last_read_at FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(last_read_at) = membership else {
        return Ok(0);
    };

    let count: i64 = match last_read_at {
        Some(position) => conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND sender_id != ?2
               AND is_deleted = 0 AND created_at > ?3",
            params![conversation_id, user_id, position],
            |r| r.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND sender_id != ?2 AND is_deleted = 0",
            params![conversation_id, user_id],
            |r| r.get(0),
        )?,
    };
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{direct, group, store};

    fn read_at(db: &Database, message_id: i64, user_id: Uuid) -> Option<String> {
        db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT read_at FROM message_read_status
                     WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id, user_id.to_string()],
                    |r| r.get(0),
                )
                .optional()?)
        })
        .unwrap()
    }

    #[test]
    fn mark_read_is_idempotent() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);
        let message = db.post_message(conversation.id, a, "hi", None, None).unwrap();

        let first = db.mark_read(message.id, b).unwrap();
        assert!(first.recorded);
        let recorded_at = read_at(&db, message.id, b).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = db.mark_read(message.id, b).unwrap();
        assert!(!second.recorded);

        // First read wins; the timestamp did not move.
        assert_eq!(read_at(&db, message.id, b).unwrap(), recorded_at);
    }

    #[test]
    fn unread_counts_for_both_sides_of_a_direct_chat() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db.post_message(conversation.id, a, "hi", None, None).unwrap();

        // Sender's own message never counts against them.
        assert_eq!(db.unread_count(conversation.id, a).unwrap(), 0);
        assert_eq!(db.unread_count(conversation.id, b).unwrap(), 1);

        db.mark_read(message.id, b).unwrap();

        assert_eq!(db.unread_count(conversation.id, b).unwrap(), 0);
        assert_eq!(db.unread_count(conversation.id, a).unwrap(), 0);
    }

    #[test]
    fn null_read_position_counts_all_history() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        for text in ["one", "two", "three"] {
            db.post_message(conversation.id, a, text, None, None).unwrap();
        }

        assert_eq!(db.unread_count(conversation.id, b).unwrap(), 3);
    }

    #[test]
    fn deleted_messages_do_not_count_as_unread() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        db.post_message(conversation.id, a, "kept", None, None).unwrap();
        let removed = db.post_message(conversation.id, a, "removed", None, None).unwrap();
        db.delete_message(removed.id, a).unwrap();

        assert_eq!(db.unread_count(conversation.id, b).unwrap(), 1);
    }

    #[test]
    fn stale_reads_from_removed_participants_are_dropped() {
        let db = store();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = group(&db, "singles ladder", &[a, b, c]);
        let message = db.post_message(conversation.id, a, "rankings up", None, None).unwrap();

        db.remove_participant(conversation.id, c).unwrap();

        let mark = db.mark_read(message.id, c).unwrap();
        assert!(!mark.recorded);
        assert!(read_at(&db, message.id, c).is_none());
    }

    #[test]
    fn receipts_survive_soft_delete() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);
        let message = db.post_message(conversation.id, a, "hold court", None, None).unwrap();

        db.mark_read(message.id, b).unwrap();
        db.toggle_reaction(message.id, b, "like").unwrap();

        db.delete_message(message.id, a).unwrap();

        assert!(read_at(&db, message.id, b).is_some());
        let reactions: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM message_reactions WHERE message_id = ?1",
                    params![message.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(reactions, 1);
    }
}
