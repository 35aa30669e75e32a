use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Messaging store: running migration v1 (chat schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                display_name  TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_type  TEXT NOT NULL DEFAULT 'direct',
                title              TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            CREATE TABLE conversation_participants (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id  INTEGER NOT NULL
                                 REFERENCES conversations(id) ON DELETE CASCADE,
                user_id          TEXT NOT NULL
                                 REFERENCES users(id) ON DELETE CASCADE,
                role             TEXT NOT NULL DEFAULT 'participant',
                joined_at        TEXT NOT NULL,
                last_read_at     TEXT,
                is_active        INTEGER NOT NULL DEFAULT 1,
                UNIQUE (conversation_id, user_id)
            );

            -- conversation_id is nullable: rows predating the conversation
            -- model kept it NULL during the legacy transition. New writes
            -- always set it.
            CREATE TABLE messages (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id      INTEGER
                                     REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id            TEXT NOT NULL REFERENCES users(id),
                content              TEXT NOT NULL,
                reply_to_message_id  INTEGER
                                     REFERENCES messages(id) ON DELETE SET NULL,
                is_edited            INTEGER NOT NULL DEFAULT 0,
                edited_at            TEXT,
                is_deleted           INTEGER NOT NULL DEFAULT 0,
                deleted_at           TEXT,
                attachment_type      TEXT,
                attachment_size      INTEGER,
                created_at           TEXT NOT NULL
            );

            CREATE TABLE message_read_status (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  INTEGER NOT NULL
                            REFERENCES messages(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                read_at     TEXT NOT NULL,
                UNIQUE (message_id, user_id)
            );

            CREATE TABLE message_reactions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id     INTEGER NOT NULL
                               REFERENCES messages(id) ON DELETE CASCADE,
                user_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                reaction_type  TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                UNIQUE (message_id, user_id, reaction_type)
            );

            CREATE INDEX idx_conversations_type
                ON conversations(conversation_type);
            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id, is_active);
            CREATE INDEX idx_messages_conversation_created
                ON messages(conversation_id, created_at);
            CREATE INDEX idx_messages_sender_created
                ON messages(sender_id, created_at);
            CREATE INDEX idx_read_status_user
                ON message_read_status(user_id, read_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Messaging store migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::testutil::{direct, store};
    use rusqlite::params;
    use uuid::Uuid;

    /// The cascade/set-null behavior lives in the schema itself, so exercise
    /// it with raw deletes that no store operation performs.
    #[test]
    fn conversation_delete_cascades_to_subtree() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let message = db
            .post_message(conversation.id, a, "hi", None, None)
            .unwrap();
        db.mark_read(message.id, b).unwrap();
        db.toggle_reaction(message.id, b, "like").unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![conversation.id],
            )?;

            let messages: i64 =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
            let participants: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_participants",
                [],
                |r| r.get(0),
            )?;
            let reads: i64 =
                conn.query_row("SELECT COUNT(*) FROM message_read_status", [], |r| r.get(0))?;
            let reactions: i64 =
                conn.query_row("SELECT COUNT(*) FROM message_reactions", [], |r| r.get(0))?;

            assert_eq!(messages, 0);
            assert_eq!(participants, 0);
            assert_eq!(reads, 0);
            assert_eq!(reactions, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reply_reference_nulls_when_target_removed() {
        let db = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = direct(&db, a, b);

        let target = db
            .post_message(conversation.id, a, "first", None, None)
            .unwrap();
        let reply = db
            .post_message(conversation.id, b, "second", Some(target.id), None)
            .unwrap();

        db.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE id = ?1", params![target.id])?;
            let reply_to: Option<i64> = conn.query_row(
                "SELECT reply_to_message_id FROM messages WHERE id = ?1",
                params![reply.id],
                |r| r.get(0),
            )?;
            assert_eq!(reply_to, None);
            Ok(())
        })
        .unwrap();
    }
}
