//! Conversation store: membership and metadata lifecycle.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use matchpoint_types::api::{ConversationSummary, MessagePreview};
use matchpoint_types::models::{Conversation, ConversationType, Participant, ParticipantRole};

use crate::error::{Result, StoreError, is_unique_violation};
use crate::models::{ConversationRow, MASKED_CONTENT, ParticipantRow, parse_uuid};
use crate::read_status::unread_count_inner;
use crate::users::ensure_user;
use crate::{Database, encode_dt, now_str, parse_dt};

const PREVIEW_CHARS: usize = 100;

impl Database {
    /// Create a conversation with its initial members, all in
    /// `role=participant`. Direct conversations take exactly two distinct
    /// users and no title; group conversations require a title.
    pub fn create_conversation(
        &self,
        conversation_type: ConversationType,
        title: Option<&str>,
        initial_participants: &[Uuid],
    ) -> Result<Conversation> {
        let mut members: Vec<Uuid> = Vec::new();
        for id in initial_participants {
            if !members.contains(id) {
                members.push(*id);
            }
        }

        let title = match conversation_type {
            ConversationType::Direct => {
                if members.len() != 2 {
                    return Err(StoreError::Validation(format!(
                        "a direct conversation requires exactly 2 participants, got {}",
                        members.len()
                    )));
                }
                // Title is ignored for direct conversations.
                None
            }
            ConversationType::Group => {
                let title = title.map(str::trim).unwrap_or("");
                if title.is_empty() {
                    return Err(StoreError::Validation(
                        "a group conversation requires a title".into(),
                    ));
                }
                Some(title.to_string())
            }
        };

        self.with_tx(|tx| {
            let now = now_str();
            tx.execute(
                "INSERT INTO conversations (conversation_type, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![conversation_type.as_str(), title, now],
            )?;
            let conversation_id = tx.last_insert_rowid();

            for user_id in &members {
                ensure_user(tx, *user_id)?;
                tx.execute(
                    "INSERT INTO conversation_participants
                         (conversation_id, user_id, role, joined_at, is_active)
                     VALUES (?1, ?2, 'participant', ?3, 1)",
                    params![conversation_id, user_id.to_string(), now],
                )?;
            }

            Ok(Conversation {
                id: conversation_id,
                conversation_type,
                title: title.clone(),
                created_at: parse_dt(&now)?,
                updated_at: parse_dt(&now)?,
            })
        })
    }

    /// Find the direct conversation between these two users, creating it if
    /// none exists. Returns `(conversation, created)`.
    pub fn get_or_create_direct(&self, user_a: Uuid, user_b: Uuid) -> Result<(Conversation, bool)> {
        if user_a == user_b {
            return Err(StoreError::Validation(
                "a direct conversation requires two distinct users".into(),
            ));
        }

        let existing = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT c.id, c.conversation_type, c.title, c.created_at, c.updated_at
                     FROM conversations c
                     JOIN conversation_participants pa
                       ON pa.conversation_id = c.id AND pa.user_id = ?1
                     JOIN conversation_participants pb
                       ON pb.conversation_id = c.id AND pb.user_id = ?2
                     WHERE c.conversation_type = 'direct'
                     LIMIT 1",
                    params![user_a.to_string(), user_b.to_string()],
                    conversation_from_row,
                )
                .optional()?;
            Ok(row)
        })?;

        if let Some(row) = existing {
            return Ok((row.into_conversation()?, false));
        }

        let conversation = self.create_conversation(ConversationType::Direct, None, &[user_a, user_b])?;
        Ok((conversation, true))
    }

    /// Conversation metadata with its active participants and their resolved
    /// display names.
    pub fn get_conversation(
        &self,
        id: i64,
    ) -> Result<Option<(Conversation, Vec<(Participant, String)>)>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, conversation_type, title, created_at, updated_at
                     FROM conversations WHERE id = ?1",
                    params![id],
                    conversation_from_row,
                )
                .optional()?;
            let Some(row) = row else { return Ok(None) };

            let mut stmt = conn.prepare(
                "SELECT p.conversation_id, p.user_id, u.display_name, p.role,
                        p.joined_at, p.last_read_at, p.is_active
                 FROM conversation_participants p
                 LEFT JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id = ?1 AND p.is_active = 1
                 ORDER BY p.joined_at, p.id",
            )?;
            let raws = stmt
                .query_map(params![id], participant_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let participants = raws
                .into_iter()
                .map(ParticipantRow::into_named)
                .collect::<Result<Vec<_>>>()?;

            Ok(Some((row.into_conversation()?, participants)))
        })
    }

    /// Add a member to a group conversation. An inactive row is reactivated:
    /// rejoin is a new membership event, so `joined_at` resets and the read
    /// position clears.
    pub fn add_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        role: ParticipantRole,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let kind = conversation_kind(tx, conversation_id)?;
            if kind == ConversationType::Direct {
                return Err(StoreError::Validation(
                    "direct conversation membership is fixed".into(),
                ));
            }

            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT id, is_active FROM conversation_participants
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id, user_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((_, true)) => Err(StoreError::Conflict(format!(
                    "user {user_id} is already an active participant"
                ))),
                Some((row_id, false)) => {
                    tx.execute(
                        "UPDATE conversation_participants
                         SET is_active = 1, role = ?2, joined_at = ?3, last_read_at = NULL
                         WHERE id = ?1",
                        params![row_id, role.as_str(), now_str()],
                    )?;
                    Ok(())
                }
                None => {
                    ensure_user(tx, user_id)?;
                    match tx.execute(
                        "INSERT INTO conversation_participants
                             (conversation_id, user_id, role, joined_at, is_active)
                         VALUES (?1, ?2, ?3, ?4, 1)",
                        params![conversation_id, user_id.to_string(), role.as_str(), now_str()],
                    ) {
                        Ok(_) => Ok(()),
                        // Lost a race with a concurrent add of the same user.
                        Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                            "user {user_id} is already an active participant"
                        ))),
                        Err(e) => Err(e.into()),
                    }
                }
            }
        })
    }

    /// Soft-remove a member. The row is kept so membership history and unread
    /// counts at time of removal stay auditable.
    pub fn remove_participant(&self, conversation_id: i64, user_id: Uuid) -> Result<()> {
        self.with_tx(|tx| {
            let kind = conversation_kind(tx, conversation_id)?;
            if kind == ConversationType::Direct {
                return Err(StoreError::Validation(
                    "direct conversation membership is fixed".into(),
                ));
            }

            let changed = tx.execute(
                "UPDATE conversation_participants SET is_active = 0
                 WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
                params![conversation_id, user_id.to_string()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "active participant {user_id} in conversation {conversation_id}"
                )));
            }
            Ok(())
        })
    }

    /// Monotonic read-position update. A timestamp behind the stored position
    /// is dropped silently: out-of-order client reports are benign, not
    /// faults. So are reports from users without active membership.
    pub fn touch_last_read(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            touch_last_read_inner(tx, conversation_id, &user_id.to_string(), timestamp)
        })
    }

    /// Conversations where the user is an active participant, newest activity
    /// first, each with its unread count and last message preview.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let uid = user_id.to_string();
            let mut stmt = conn.prepare(
                "SELECT c.id, c.conversation_type, c.title, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1 AND p.is_active = 1
                 ORDER BY c.updated_at DESC, c.id DESC",
            )?;
            let rows = stmt
                .query_map(params![uid], conversation_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut summaries = Vec::with_capacity(rows.len());
            for row in rows {
                let conversation = row.into_conversation()?;
                let participant_count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM conversation_participants
                     WHERE conversation_id = ?1 AND is_active = 1",
                    params![conversation.id],
                    |r| r.get(0),
                )?;
                let unread_count = unread_count_inner(conn, conversation.id, &uid)?;
                let last_message = last_message_preview(conn, conversation.id)?;

                summaries.push(ConversationSummary {
                    id: conversation.id,
                    conversation_type: conversation.conversation_type,
                    title: conversation.title,
                    updated_at: conversation.updated_at,
                    participant_count,
                    unread_count,
                    last_message,
                });
            }
            Ok(summaries)
        })
    }

    /// Whether the user may read this conversation (active membership).
    pub fn can_access(&self, conversation_id: i64, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| is_active_participant(conn, conversation_id, &user_id.to_string()))
    }

    /// Whether the user is an active admin of this conversation.
    pub fn is_admin(&self, conversation_id: i64, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| is_active_admin(conn, conversation_id, &user_id.to_string()))
    }
}

pub(crate) fn conversation_kind(conn: &Connection, conversation_id: i64) -> Result<ConversationType> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT conversation_type FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()?;
    let kind =
        kind.ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
    ConversationType::parse(&kind)
        .ok_or_else(|| StoreError::Internal(format!("unknown conversation type {kind:?}")))
}

pub(crate) fn is_active_participant(
    conn: &Connection,
    conversation_id: i64,
    user_id: &str,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn is_active_admin(
    conn: &Connection,
    conversation_id: i64,
    user_id: &str,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversation_participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1 AND role = 'admin'",
            params![conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn touch_last_read_inner(
    conn: &Connection,
    conversation_id: i64,
    user_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    let ts = encode_dt(timestamp);
    conn.execute(
        "UPDATE conversation_participants SET last_read_at = ?3
         WHERE conversation_id = ?1 AND user_id = ?2 AND is_active = 1
           AND (last_read_at IS NULL OR last_read_at < ?3)",
        params![conversation_id, user_id, ts],
    )?;
    Ok(())
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        conversation_type: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        role: row.get(3)?,
        joined_at: row.get(4)?,
        last_read_at: row.get(5)?,
        is_active: row.get(6)?,
    })
}

fn last_message_preview(conn: &Connection, conversation_id: i64) -> Result<Option<MessagePreview>> {
    let raw: Option<(i64, String, Option<String>, String, bool, String)> = conn
        .query_row(
            "SELECT m.id, m.sender_id, u.display_name, m.content, m.is_deleted, m.created_at
             FROM messages m
             LEFT JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ?1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT 1",
            params![conversation_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    raw.map(|(id, sender_id, display_name, content, is_deleted, created_at)| {
        let content = if is_deleted {
            MASKED_CONTENT.to_string()
        } else {
            preview(&content)
        };
        Ok(MessagePreview {
            id,
            sender_id: parse_uuid(&sender_id)?,
            sender_name: display_name.unwrap_or_else(|| "unknown".to_string()),
            content,
            created_at: parse_dt(&created_at)?,
        })
    })
    .transpose()
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        content.to_string()
    } else {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{direct, group, store};

    #[test]
    fn direct_requires_exactly_two_participants() {
        let db = store();
        let a = Uuid::new_v4();

        let one = db.create_conversation(ConversationType::Direct, None, &[a]);
        assert!(matches!(one, Err(StoreError::Validation(_))));

        let three = db.create_conversation(
            ConversationType::Direct,
            None,
            &[a, Uuid::new_v4(), Uuid::new_v4()],
        );
        assert!(matches!(three, Err(StoreError::Validation(_))));

        // Duplicates collapse before the count check.
        let dup = db.create_conversation(ConversationType::Direct, None, &[a, a]);
        assert!(matches!(dup, Err(StoreError::Validation(_))));
    }

    #[test]
    fn group_requires_title() {
        let db = store();
        let members = [Uuid::new_v4(), Uuid::new_v4()];

        let untitled = db.create_conversation(ConversationType::Group, None, &members);
        assert!(matches!(untitled, Err(StoreError::Validation(_))));

        let blank = db.create_conversation(ConversationType::Group, Some("   "), &members);
        assert!(matches!(blank, Err(StoreError::Validation(_))));
    }

    #[test]
    fn direct_title_is_ignored() {
        let db = store();
        let conversation = db
            .create_conversation(
                ConversationType::Direct,
                Some("should vanish"),
                &[Uuid::new_v4(), Uuid::new_v4()],
            )
            .unwrap();
        assert_eq!(conversation.title, None);
    }

    #[test]
    fn direct_membership_is_fixed() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let add = db.add_participant(conversation.id, Uuid::new_v4(), ParticipantRole::Participant);
        assert!(matches!(add, Err(StoreError::Validation(_))));

        let remove = db.remove_participant(conversation.id, b);
        assert!(matches!(remove, Err(StoreError::Validation(_))));

        // The invariant holds: still exactly two active participants.
        let (_, participants) = db.get_conversation(conversation.id).unwrap().unwrap();
        assert_eq!(participants.len(), 2);
    }

    #[test]
    fn add_active_participant_is_a_conflict() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = group(&db, "doubles planning", &[a, b]);

        let again = db.add_participant(conversation.id, b, ParticipantRole::Participant);
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn rejoin_reactivates_row_and_resets_read_position() {
        let db = store();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conversation = group(&db, "club night", &[a, b, c]);

        db.touch_last_read(conversation.id, c, Utc::now()).unwrap();
        db.remove_participant(conversation.id, c).unwrap();

        db.add_participant(conversation.id, c, ParticipantRole::Participant)
            .unwrap();

        // Reactivated, not duplicated.
        let row_count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM conversation_participants
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation.id, c.to_string()],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(row_count, 1);

        let (_, participants) = db.get_conversation(conversation.id).unwrap().unwrap();
        let rejoined = participants
            .iter()
            .find(|(p, _)| p.user_id == c)
            .map(|(p, _)| p)
            .unwrap();
        assert!(rejoined.is_active);
        assert_eq!(rejoined.last_read_at, None);
    }

    #[test]
    fn removing_unknown_participant_is_not_found() {
        let db = store();
        let conversation = group(&db, "ladder", &[Uuid::new_v4(), Uuid::new_v4()]);

        let missing = db.remove_participant(conversation.id, Uuid::new_v4());
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn touch_last_read_is_monotonic() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);

        db.touch_last_read(conversation.id, b, later).unwrap();
        // Regression: dropped without error.
        db.touch_last_read(conversation.id, b, earlier).unwrap();

        let (_, participants) = db.get_conversation(conversation.id).unwrap().unwrap();
        let position = participants
            .iter()
            .find(|(p, _)| p.user_id == b)
            .and_then(|(p, _)| p.last_read_at)
            .unwrap();
        assert_eq!(position.timestamp_micros(), later.timestamp_micros());
    }

    #[test]
    fn get_or_create_direct_is_idempotent() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (first, created) = db.get_or_create_direct(a, b).unwrap();
        assert!(created);

        let (second, created) = db.get_or_create_direct(a, b).unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);

        // Order of the pair does not matter.
        let (swapped, created) = db.get_or_create_direct(b, a).unwrap();
        assert!(!created);
        assert_eq!(swapped.id, first.id);
    }

    #[test]
    fn get_or_create_direct_rejects_self() {
        let db = store();
        let a = Uuid::new_v4();
        assert!(matches!(
            db.get_or_create_direct(a, a),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn list_conversations_orders_by_activity() {
        let db = store();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let older = direct(&db, a, b);
        let newer = group(&db, "weekend round robin", &[a, b, c]);

        // Activity in the older conversation bubbles it to the top.
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.post_message(older.id, b, "court 4 at six?", None, None)
            .unwrap();

        let summaries = db.list_conversations(a).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, older.id);
        assert_eq!(summaries[1].id, newer.id);

        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[0].participant_count, 2);
        let preview = summaries[0].last_message.as_ref().unwrap();
        assert_eq!(preview.content, "court 4 at six?");
        assert_eq!(preview.sender_id, b);

        // Not a participant anywhere: empty listing.
        assert!(db.list_conversations(Uuid::new_v4()).unwrap().is_empty());
    }
}
