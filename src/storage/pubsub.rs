//! Durable pub/sub reservations and reserved messages

use super::Database;
use crate::pubsub::channel_matches;
use anyhow::{Context, Result};
use rusqlite::params;

/// A stored message awaiting acknowledgement by one reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedMessage {
    pub id: i64,
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Database {
    // ==================== Pub/Sub Reservations ====================

    /// Create a reservation for `channel` (no-op when it exists)
    pub fn add_reservation(&self, reservation_id: &str, channel: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO pubsubreservations (reservation_id, channel) VALUES (?1, ?2)",
            params![reservation_id, channel],
        )
        .context("Failed to add pub/sub reservation")?;
        Ok(())
    }

    /// Reservations whose channel covers `channel`, as (reservation id,
    /// reserved channel) pairs
    pub fn reservations_matching(&self, channel: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reservation_id, channel FROM pubsubreservations ORDER BY reservation_id, channel",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut matching = Vec::new();
        for row in rows {
            let (reservation_id, reserved) = row?;
            if channel_matches(&reserved, channel) {
                matching.push((reservation_id, reserved));
            }
        }
        Ok(matching)
    }

    /// Persist a message for every given reservation
    pub fn store_reserved_message(
        &self,
        channel: &str,
        payload: &[u8],
        reservations: &[(String, String)],
    ) -> Result<i64> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO pubsubmessages (channel, payload) VALUES (?1, ?2)",
                params![channel, payload],
            )?;
            let message = tx.last_insert_rowid();

            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO pubsubreservedmessages (reservation_id, channel, message) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for (reservation_id, reserved) in reservations {
                insert.execute(params![reservation_id, reserved, message])?;
            }
            Ok(message)
        })
        .context("Failed to store reserved message")
    }

    /// Undelivered messages of a reservation in insertion order
    pub fn pending_reserved_messages(
        &self,
        reservation_id: &str,
        channel: &str,
    ) -> Result<Vec<ReservedMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.channel, m.payload FROM pubsubreservedmessages rm \
             JOIN pubsubmessages m ON m.id = rm.message \
             WHERE rm.reservation_id = ?1 AND rm.channel = ?2 ORDER BY m.id",
        )?;
        let rows = stmt.query_map(params![reservation_id, channel], |row| {
            Ok(ReservedMessage {
                id: row.get(0)?,
                channel: row.get(1)?,
                payload: row.get(2)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Record delivery to one reservation; the message itself is removed once
    /// no reservation still holds it
    pub fn acknowledge_message(
        &self,
        reservation_id: &str,
        channel: &str,
        message: i64,
    ) -> Result<()> {
        self.transaction(|tx| {
            tx.execute(
                "DELETE FROM pubsubreservedmessages \
                 WHERE reservation_id = ?1 AND channel = ?2 AND message = ?3",
                params![reservation_id, channel, message],
            )?;
            tx.execute(
                "DELETE FROM pubsubmessages WHERE id = ?1 \
                 AND NOT EXISTS (SELECT 1 FROM pubsubreservedmessages WHERE message = ?1)",
                params![message],
            )?;
            Ok(())
        })
        .context("Failed to acknowledge reserved message")
    }

    /// Number of stored messages not yet acknowledged by every reservation
    pub fn stored_message_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row("SELECT COUNT(*) FROM pubsubmessages", [], |row| row.get(0))
            .context("Failed to count stored messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_message_removed_after_all_acks() {
        let db = Database::open_in_memory().unwrap();
        db.add_reservation("mailer", "reviews").unwrap();
        db.add_reservation("indexer", "reviews/1").unwrap();
        db.add_reservation("other", "changesets").unwrap();

        let matching = db.reservations_matching("reviews/1").unwrap();
        assert_eq!(matching.len(), 2);
        assert!(db.reservations_matching("reviewsX").unwrap().is_empty());

        let first = db
            .store_reserved_message("reviews/1", b"{\"a\":1}", &matching)
            .unwrap();
        let second = db
            .store_reserved_message("reviews/1", b"{\"a\":2}", &matching)
            .unwrap();

        let pending = db.pending_reserved_messages("mailer", "reviews").unwrap();
        assert_eq!(
            pending.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![first, second]
        );

        db.acknowledge_message("mailer", "reviews", first).unwrap();
        assert_eq!(db.stored_message_count().unwrap(), 2);
        db.acknowledge_message("indexer", "reviews/1", first).unwrap();
        assert_eq!(db.stored_message_count().unwrap(), 1);
        assert_eq!(
            db.pending_reserved_messages("indexer", "reviews/1").unwrap()[0].payload,
            b"{\"a\":2}"
        );
    }
}
