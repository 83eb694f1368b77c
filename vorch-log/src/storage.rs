use anyhow::{anyhow, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use ulid::Ulid;

use crate::Event;

const TABLE_EVENTS: TableDefinition<u128, &[u8]> = TableDefinition::new("events");
const TABLE_IDX_OBJECT: TableDefinition<(&str, u128), ()> = TableDefinition::new("idx_object");

/// redb-backed, append-only event table with an object index.
pub struct EventLog {
    db: Database,
}

impl EventLog {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = data_dir.as_ref().join("events.redb");
        let db = Database::create(&db_path)?;

        let txn = db.begin_write()?;
        txn.open_table(TABLE_EVENTS)?;
        txn.open_table(TABLE_IDX_OBJECT)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Insert events that already carry their ULID.
    pub fn append_batch(&self, events: Vec<Event>) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE_EVENTS)?;
            let mut idx_obj = txn.open_table(TABLE_IDX_OBJECT)?;

            for event in events {
                let ulid: Ulid = event
                    .id
                    .parse()
                    .map_err(|e| anyhow!("Invalid ULID in event: {e}"))?;
                let key = ulid.0;
                let encoded = bincode::serialize(&event)?;
                table.insert(key, encoded.as_slice())?;
                if !event.object_id.is_empty() {
                    idx_obj.insert((event.object_id.as_str(), key), ())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Newest events first, optionally restricted to one object.
    pub fn query(&self, object_id: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE_EVENTS)?;
        let mut results = Vec::new();

        if let Some(obj) = object_id {
            let idx_obj = txn.open_table(TABLE_IDX_OBJECT)?;
            for item in idx_obj.range((obj, 0u128)..=(obj, u128::MAX))?.rev() {
                if results.len() >= limit {
                    break;
                }
                let (key, _) = item?;
                let (_, ulid_key) = key.value();
                if let Some(access) = table.get(ulid_key)? {
                    results.push(bincode::deserialize(access.value())?);
                }
            }
        } else {
            for item in table.iter()?.rev() {
                if results.len() >= limit {
                    break;
                }
                let (_, value) = item?;
                results.push(bincode::deserialize(value.value())?);
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_and_query_all() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        let event = Event::new("volume", "vol-1", "user-1", "create_volume", "inserted");
        log.append_batch(vec![event.clone()]).unwrap();

        let results = log.query(None, 100).unwrap();
        assert_eq!(results, vec![event]);
    }

    #[test]
    fn query_by_object_id() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append_batch(vec![
            Event::new("volume", "vol-1", "u", "create_volume", "a"),
            Event::new("volume", "vol-2", "u", "create_volume", "b"),
            Event::new("volume", "vol-1", "u", "delete_volume", "c"),
        ])
        .unwrap();

        let results = log.query(Some("vol-1"), 100).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|e| e.object_id == "vol-1"));

        let limited = log.query(Some("vol-1"), 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    fn at(ms: u64, object_id: &str, message: &str) -> Event {
        let mut event = Event::new("volume", object_id, "u", "edit_volume", message);
        event.id = Ulid::from_parts(ms, 0).to_string();
        event.timestamp_ms = ms;
        event
    }

    #[test]
    fn newest_events_come_first() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        log.append_batch(vec![
            at(1_000, "vol-1", "first"),
            at(3_000, "vol-1", "third"),
            at(2_000, "vol-2", "second"),
        ])
        .unwrap();

        let all: Vec<_> = log
            .query(None, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(all, vec!["third", "second", "first"]);

        let latest = log.query(Some("vol-1"), 1).unwrap();
        assert_eq!(latest[0].message, "third");
    }

    #[test]
    fn reopen_keeps_events() {
        let dir = TempDir::new().unwrap();
        {
            let log = EventLog::open(dir.path()).unwrap();
            log.append_batch(vec![Event::new("vm", "vm-1", "u", "start", "ok")])
                .unwrap();
        }
        let log = EventLog::open(dir.path()).unwrap();
        assert_eq!(log.query(Some("vm-1"), 10).unwrap().len(), 1);
    }

    #[test]
    fn rejects_malformed_id() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let mut event = Event::new("vm", "vm-1", "u", "start", "ok");
        event.id = "not-a-ulid".to_string();
        assert!(log.append_batch(vec![event]).is_err());
    }
}
