//! Message store: append-only history with edit/soft-delete tracking and
//! reply threading.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use matchpoint_types::models::Attachment;

use crate::conversations::{conversation_kind, is_active_admin, is_active_participant};
use crate::error::{Result, StoreError};
use crate::models::{MessageRecord, RawMessage};
use crate::{Database, encode_dt, now_str, parse_dt};

const MAX_PAGE_SIZE: u32 = 200;

/// Pagination cursor: the `(created_at, id)` of the last message from the
/// previous page. `id` disambiguates same-timestamp ties; without it the
/// cursor falls back to strictly-older messages.
#[derive(Debug, Clone)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Option<i64>,
}

const MESSAGE_SELECT: &str = "\
    SELECT m.id, m.conversation_id, m.sender_id, u.display_name, m.content,
           m.reply_to_message_id, m.is_edited, m.edited_at, m.is_deleted,
           m.deleted_at, m.attachment_type, m.attachment_size, m.created_at
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id";

impl Database {
    /// Append a message. The sender must hold active membership; a reply must
    /// target a live message in the same conversation. Bumps the
    /// conversation's `updated_at` in the same transaction.
    pub fn post_message(
        &self,
        conversation_id: i64,
        sender_id: Uuid,
        content: &str,
        reply_to: Option<i64>,
        attachment: Option<&Attachment>,
    ) -> Result<MessageRecord> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::Validation("message content is empty".into()));
        }

        self.with_tx(|tx| {
            conversation_kind(tx, conversation_id)?;

            let sid = sender_id.to_string();
            if !is_active_participant(tx, conversation_id, &sid)? {
                return Err(StoreError::Authorization(format!(
                    "user {sender_id} is not an active participant of conversation {conversation_id}"
                )));
            }

            if let Some(target_id) = reply_to {
                let target = load_message(tx, target_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {target_id}")))?;
                if target.conversation_id != conversation_id {
                    return Err(StoreError::Validation(
                        "reply target belongs to a different conversation".into(),
                    ));
                }
                if target.is_deleted {
                    return Err(StoreError::Validation(
                        "reply target has been removed".into(),
                    ));
                }
            }

            let now = now_str();
            tx.execute(
                "INSERT INTO messages
                     (conversation_id, sender_id, content, reply_to_message_id,
                      attachment_type, attachment_size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conversation_id,
                    sid,
                    content,
                    reply_to,
                    attachment.map(|a| a.content_type.as_str()),
                    attachment.map(|a| a.size_bytes),
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![conversation_id, now],
            )?;

            load_message(tx, id)?
                .ok_or_else(|| StoreError::Internal(format!("message {id} vanished mid-transaction")))?
                .into_record()
        })
    }

    /// Replace a message's content. Only the original sender may edit, only
    /// while the message is live and the edit window has not elapsed.
    pub fn edit_message(
        &self,
        message_id: i64,
        editor_id: Uuid,
        new_content: &str,
    ) -> Result<MessageRecord> {
        let new_content = new_content.trim();
        if new_content.is_empty() {
            return Err(StoreError::Validation("message content is empty".into()));
        }

        self.with_tx(|tx| {
            let msg = load_message(tx, message_id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

            if msg.sender_id != editor_id.to_string() {
                return Err(StoreError::Authorization(
                    "only the sender may edit a message".into(),
                ));
            }
            if msg.is_deleted {
                return Err(StoreError::State("cannot edit a removed message".into()));
            }

            let created_at = parse_dt(&msg.created_at)?;
            if Utc::now() - created_at > self.edit_window() {
                return Err(StoreError::State(format!(
                    "edit window of {} minutes has elapsed",
                    self.edit_window().num_minutes()
                )));
            }

            tx.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1",
                params![message_id, new_content, now_str()],
            )?;

            load_message(tx, message_id)?
                .ok_or_else(|| {
                    StoreError::Internal(format!("message {message_id} vanished mid-transaction"))
                })?
                .into_record()
        })
    }

    /// Soft-delete: the row and its content stay (read receipts and reactions
    /// keep referencing it), but every read path masks the content from then
    /// on. Permitted for the sender or an active conversation admin.
    pub fn delete_message(&self, message_id: i64, actor_id: Uuid) -> Result<MessageRecord> {
        self.with_tx(|tx| {
            let msg = load_message(tx, message_id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

            if msg.is_deleted {
                return Err(StoreError::State("message is already removed".into()));
            }

            let aid = actor_id.to_string();
            if msg.sender_id != aid && !is_active_admin(tx, msg.conversation_id, &aid)? {
                return Err(StoreError::Authorization(
                    "only the sender or a conversation admin may remove a message".into(),
                ));
            }

            tx.execute(
                "UPDATE messages SET is_deleted = 1, deleted_at = ?2 WHERE id = ?1",
                params![message_id, now_str()],
            )?;

            load_message(tx, message_id)?
                .ok_or_else(|| {
                    StoreError::Internal(format!("message {message_id} vanished mid-transaction"))
                })?
                .into_record()
        })
    }

    /// One page of history, newest first, same-timestamp ties in insertion
    /// order. Re-requesting with the cursor of the last returned row restarts
    /// the scan with no gaps or repeats.
    pub fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<&MessageCursor>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            conversation_kind(conn, conversation_id)?;

            let limit = limit.min(MAX_PAGE_SIZE) as i64;
            let raws = match before {
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "{MESSAGE_SELECT}
                         WHERE m.conversation_id = ?1
                         ORDER BY m.created_at DESC, m.id ASC
                         LIMIT ?2"
                    ))?;
                    stmt.query_map(params![conversation_id, limit], raw_message_from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                Some(cursor) => {
                    let ts = encode_dt(cursor.created_at);
                    // With no tie-breaking id, `id > i64::MAX` is never true
                    // and the cursor degrades to strictly-older messages.
                    let anchor = cursor.id.unwrap_or(i64::MAX);
                    let mut stmt = conn.prepare(&format!(
                        "{MESSAGE_SELECT}
                         WHERE m.conversation_id = ?1
                           AND (m.created_at < ?2 OR (m.created_at = ?2 AND m.id > ?3))
                         ORDER BY m.created_at DESC, m.id ASC
                         LIMIT ?4"
                    ))?;
                    stmt.query_map(
                        params![conversation_id, ts, anchor, limit],
                        raw_message_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };

            raws.into_iter().map(RawMessage::into_record).collect()
        })
    }
}

/// Load one message row. Legacy rows with a NULL conversation are invisible
/// through this store.
pub(crate) fn load_message(conn: &Connection, id: i64) -> Result<Option<RawMessage>> {
    let row = conn
        .query_row(
            &format!("{MESSAGE_SELECT} WHERE m.id = ?1 AND m.conversation_id IS NOT NULL"),
            params![id],
            raw_message_from_row,
        )
        .optional()?;
    Ok(row)
}

fn raw_message_from_row(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        reply_to: row.get(5)?,
        is_edited: row.get(6)?,
        edited_at: row.get(7)?,
        is_deleted: row.get(8)?,
        deleted_at: row.get(9)?,
        attachment_type: row.get(10)?,
        attachment_size: row.get(11)?,
        created_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MASKED_CONTENT;
    use crate::testutil::{direct, group, store};
    use crate::{Database, StoreOptions};
    use matchpoint_types::models::ParticipantRole;

    #[test]
    fn post_requires_active_membership() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let outsider = db.post_message(conversation.id, Uuid::new_v4(), "hello", None, None);
        assert!(matches!(outsider, Err(StoreError::Authorization(_))));
    }

    #[test]
    fn removed_participant_cannot_post() {
        let db = store();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = group(&db, "mixed doubles", &[a, b, c]);

        db.remove_participant(conversation.id, b).unwrap();

        let posted = db.post_message(conversation.id, b, "am I still in?", None, None);
        assert!(matches!(posted, Err(StoreError::Authorization(_))));
    }

    #[test]
    fn post_rejects_blank_content() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let blank = db.post_message(conversation.id, a, "   \n", None, None);
        assert!(matches!(blank, Err(StoreError::Validation(_))));
    }

    #[test]
    fn post_to_missing_conversation_is_not_found() {
        let db = store();
        let posted = db.post_message(999, Uuid::new_v4(), "anyone here?", None, None);
        assert!(matches!(posted, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn reply_must_stay_in_conversation() {
        let db = store();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let first = direct(&db, a, b);
        let second = direct(&db, a, c);

        let m1 = db.post_message(first.id, a, "serve at noon?", None, None).unwrap();
        let m2 = db
            .post_message(first.id, a, "bring balls", Some(m1.id), None)
            .unwrap();
        assert_eq!(m2.reply_to, Some(m1.id));

        // Same reply target from another conversation is rejected.
        let cross = db.post_message(second.id, a, "also noon?", Some(m1.id), None);
        assert!(matches!(cross, Err(StoreError::Validation(_))));
    }

    #[test]
    fn reply_to_removed_message_rejected() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let m1 = db.post_message(conversation.id, a, "scratch that", None, None).unwrap();
        db.delete_message(m1.id, a).unwrap();

        let reply = db.post_message(conversation.id, b, "scratch what?", Some(m1.id), None);
        assert!(matches!(reply, Err(StoreError::Validation(_))));
    }

    #[test]
    fn reply_to_missing_message_is_not_found() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let reply = db.post_message(conversation.id, a, "re:", Some(424242), None);
        assert!(matches!(reply, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn post_bumps_conversation_updated_at() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        std::thread::sleep(std::time::Duration::from_millis(5));
        db.post_message(conversation.id, a, "ping", None, None).unwrap();

        let (after, _) = db.get_conversation(conversation.id).unwrap().unwrap();
        assert!(after.updated_at > conversation.updated_at);
    }

    #[test]
    fn post_records_attachment_metadata() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let attachment = Attachment {
            content_type: "image/png".into(),
            size_bytes: 48_213,
        };
        let message = db
            .post_message(conversation.id, a, "court map", None, Some(&attachment))
            .unwrap();

        let stored = message.attachment.unwrap();
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.size_bytes, 48_213);
    }

    #[test]
    fn edit_is_sender_only() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db.post_message(conversation.id, a, "3pm", None, None).unwrap();

        let by_other = db.edit_message(message.id, b, "4pm");
        assert!(matches!(by_other, Err(StoreError::Authorization(_))));

        let edited = db.edit_message(message.id, a, "4pm").unwrap();
        assert!(edited.is_edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.content, "4pm");
    }

    #[test]
    fn edit_after_delete_is_a_state_error() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db.post_message(conversation.id, a, "oops", None, None).unwrap();
        db.delete_message(message.id, a).unwrap();

        let edit = db.edit_message(message.id, a, "fixed");
        assert!(matches!(edit, Err(StoreError::State(_))));
    }

    #[test]
    fn edit_window_elapses() {
        let db = Database::open_in_memory_with(StoreOptions {
            edit_window: chrono::Duration::zero(),
        })
        .unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db.post_message(conversation.id, a, "too late", None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let edit = db.edit_message(message.id, a, "never mind");
        assert!(matches!(edit, Err(StoreError::State(_))));
    }

    #[test]
    fn delete_permits_sender_and_admin_only() {
        let db = store();
        let (a, b, moderator) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = group(&db, "league chat", &[a, b]);
        db.add_participant(conversation.id, moderator, ParticipantRole::Admin)
            .unwrap();

        let first = db.post_message(conversation.id, a, "one", None, None).unwrap();
        let second = db.post_message(conversation.id, a, "two", None, None).unwrap();

        // Plain participant, not the sender.
        let by_peer = db.delete_message(first.id, b);
        assert!(matches!(by_peer, Err(StoreError::Authorization(_))));

        let by_sender = db.delete_message(first.id, a).unwrap();
        assert!(by_sender.is_deleted);

        let by_admin = db.delete_message(second.id, moderator).unwrap();
        assert!(by_admin.is_deleted);

        let twice = db.delete_message(first.id, a);
        assert!(matches!(twice, Err(StoreError::State(_))));
    }

    #[test]
    fn deleted_content_is_masked_but_retained() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db
            .post_message(conversation.id, a, "meet at the clubhouse", None, None)
            .unwrap();
        let deleted = db.delete_message(message.id, a).unwrap();

        assert_eq!(deleted.display_content(), MASKED_CONTENT);

        // The stored row keeps the original text.
        let stored: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT content FROM messages WHERE id = ?1",
                    params![message.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(stored, "meet at the clubhouse");
    }

    #[test]
    fn listing_is_reverse_chronological_with_stable_pages() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        for text in ["one", "two", "three", "four", "five"] {
            db.post_message(conversation.id, a, text, None, None).unwrap();
            // Distinct timestamps; the tie-break path has its own test.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let page1 = db.list_messages(conversation.id, None, 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].content, "five");
        assert_eq!(page1[1].content, "four");

        let cursor = MessageCursor {
            created_at: page1[1].created_at,
            id: Some(page1[1].id),
        };
        let page2 = db.list_messages(conversation.id, Some(&cursor), 2).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].content, "three");
        assert_eq!(page2[1].content, "two");
    }

    #[test]
    fn same_timestamp_ties_break_by_insertion_order() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let m1 = db.post_message(conversation.id, a, "first", None, None).unwrap();
        let m2 = db.post_message(conversation.id, a, "second", None, None).unwrap();
        let m3 = db.post_message(conversation.id, a, "third", None, None).unwrap();

        // Collapse all three onto one timestamp to force the tie-break.
        let shared = encode_dt(m1.created_at);
        db.with_conn(|conn| {
            conn.execute("UPDATE messages SET created_at = ?1", params![shared])?;
            Ok(())
        })
        .unwrap();

        let page1 = db.list_messages(conversation.id, None, 2).unwrap();
        assert_eq!(
            page1.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![m1.id, m2.id]
        );

        let cursor = MessageCursor {
            created_at: page1[1].created_at,
            id: Some(page1[1].id),
        };
        let page2 = db.list_messages(conversation.id, Some(&cursor), 2).unwrap();
        assert_eq!(page2.iter().map(|m| m.id).collect::<Vec<_>>(), vec![m3.id]);
    }

    #[test]
    fn legacy_rows_without_conversation_stay_invisible() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        // A row left behind by the legacy schema: no conversation reference.
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, created_at)
                 VALUES (NULL, ?1, 'old world', ?2)",
                params![a.to_string(), now_str()],
            )?;
            Ok(())
        })
        .unwrap();
        let legacy_id: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT MAX(id) FROM messages", [], |r| r.get(0))?)
            })
            .unwrap();

        assert!(db.list_messages(conversation.id, None, 50).unwrap().is_empty());

        let edit = db.edit_message(legacy_id, a, "new world");
        assert!(matches!(edit, Err(StoreError::NotFound(_))));
    }
}
