//! User-agent dictionary: raw user-agent strings <-> small integer ids.
//!
//! Ids are handed out densely from 1 and are never reused; stored click rows
//! embed them as foreign keys.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::codec::Record;
use crate::error::Result;
use crate::models::{ClickRecord, StoredClick, UserAgentEntry};
use crate::table::TableStore;

/// Shown for clicks whose id is missing from the dictionary.
pub const UNKNOWN_AGENT: &str = "Unknown";

#[derive(Debug, Default)]
struct Entries {
    by_id: HashMap<u32, String>,
    by_agent: HashMap<String, u32>,
    next_id: u32,
}

impl Entries {
    fn from_rows(rows: Vec<UserAgentEntry>) -> Self {
        let mut entries = Entries {
            next_id: 1,
            ..Default::default()
        };
        for row in rows {
            if row.id == 0 {
                tracing::warn!("Skipping user agent row without a valid id: {:?}", row.user_agent);
                continue;
            }
            entries.insert(row.id, row.user_agent);
        }
        entries
    }

    fn insert(&mut self, id: u32, agent: String) {
        self.next_id = self.next_id.max(id.saturating_add(1));
        self.by_agent.entry(agent.clone()).or_insert(id);
        self.by_id.insert(id, agent);
    }

    fn rows(&self) -> Vec<UserAgentEntry> {
        let mut rows: Vec<UserAgentEntry> = self
            .by_id
            .iter()
            .map(|(id, agent)| UserAgentEntry {
                id: *id,
                user_agent: agent.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }
}

pub struct UserAgentDictionary {
    tables: Arc<TableStore>,
    entries: Mutex<Option<Entries>>,
}

impl UserAgentDictionary {
    pub fn new(tables: Arc<TableStore>) -> Self {
        Self {
            tables,
            entries: Mutex::new(None),
        }
    }

    async fn loaded(&self) -> Result<MappedMutexGuard<'_, Entries>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            let rows: Vec<UserAgentEntry> = self.tables.read_all(UserAgentEntry::FILE).await?;
            let entries = Entries::from_rows(rows);
            tracing::debug!("Loaded {} user agent(s)", entries.by_id.len());
            *guard = Some(entries);
        }
        Ok(MutexGuard::map(guard, |slot| slot.get_or_insert_with(Entries::default)))
    }

    /// Id for `user_agent`, appending a new dictionary row the first time the
    /// string is seen.
    pub async fn get_or_create(&self, user_agent: &str) -> Result<u32> {
        let mut entries = self.loaded().await?;
        if let Some(id) = entries.by_agent.get(user_agent) {
            return Ok(*id);
        }

        let entry = UserAgentEntry {
            id: entries.next_id.max(1),
            user_agent: user_agent.to_owned(),
        };
        self.tables
            .append(UserAgentEntry::FILE, &entry, UserAgentEntry::FIELDS)
            .await?;
        entries.insert(entry.id, entry.user_agent);
        Ok(entry.id)
    }

    pub async fn lookup(&self, id: u32) -> Result<Option<String>> {
        Ok(self.loaded().await?.by_id.get(&id).cloned())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.loaded().await?.by_id.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Resolve stored clicks back to their full user-agent strings.
    pub async fn decorate(&self, clicks: &[StoredClick]) -> Result<Vec<ClickRecord>> {
        let entries = self.loaded().await?;
        Ok(clicks
            .iter()
            .map(|click| ClickRecord {
                short_code: click.short_code.clone(),
                timestamp: click.timestamp.clone(),
                ip: click.ip.clone(),
                user_agent: entries
                    .by_id
                    .get(&click.user_agent_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_AGENT.to_owned()),
                referrer: click.referrer.clone(),
                source_type: click.source_type.clone(),
            })
            .collect())
    }

    /// Register every agent in `agents` (first seen wins), rewrite the
    /// dictionary file in full and return the id of each agent.
    pub(crate) async fn absorb<'a, I>(&self, agents: I) -> Result<HashMap<String, u32>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = self.loaded().await?;
        let mut staged = Entries {
            by_id: entries.by_id.clone(),
            by_agent: entries.by_agent.clone(),
            next_id: entries.next_id.max(1),
        };

        let mut ids = HashMap::new();
        for agent in agents {
            if ids.contains_key(agent) {
                continue;
            }
            let id = match staged.by_agent.get(agent) {
                Some(id) => *id,
                None => {
                    let id = staged.next_id;
                    staged.insert(id, agent.to_owned());
                    id
                }
            };
            ids.insert(agent.to_owned(), id);
        }

        self.tables
            .write_all(UserAgentEntry::FILE, &staged.rows(), UserAgentEntry::FIELDS)
            .await?;
        *entries = staged;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use tempfile::TempDir;

    fn create_test_dictionary() -> (UserAgentDictionary, Arc<TableStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let tables = Arc::new(TableStore::new(dir.path()));
        (UserAgentDictionary::new(tables.clone()), tables, dir)
    }

    fn line_count(tables: &TableStore) -> usize {
        std::fs::read_to_string(tables.path(UserAgentEntry::FILE))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn ids_start_at_one_and_are_dense() {
        let (dict, _tables, _dir) = create_test_dictionary();
        assert_eq!(dict.get_or_create("UA1").await.unwrap(), 1);
        assert_eq!(dict.get_or_create("UA2").await.unwrap(), 2);
        assert_eq!(dict.get_or_create("").await.unwrap(), 3);
        assert_eq!(dict.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn repeated_lookup_does_not_grow_the_file() {
        let (dict, tables, _dir) = create_test_dictionary();
        let first = dict.get_or_create("Mozilla/5.0 (X11; Linux)").await.unwrap();
        let before = line_count(&tables);
        let second = dict.get_or_create("Mozilla/5.0 (X11; Linux)").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(line_count(&tables), before);
    }

    #[tokio::test]
    async fn ids_survive_a_reload() {
        let (dict, tables, _dir) = create_test_dictionary();
        dict.get_or_create("UA1").await.unwrap();
        dict.get_or_create("agent, with \"quotes\"").await.unwrap();

        let reloaded = UserAgentDictionary::new(tables);
        assert_eq!(reloaded.get_or_create("agent, with \"quotes\"").await.unwrap(), 2);
        assert_eq!(reloaded.get_or_create("UA3").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn next_id_follows_the_highest_existing_id() {
        let (dict, tables, _dir) = create_test_dictionary();
        std::fs::write(tables.path(UserAgentEntry::FILE), "id,userAgent\n1,a\n7,b\n0,broken\n").unwrap();

        assert_eq!(dict.get_or_create("c").await.unwrap(), 8);
        assert_eq!(dict.lookup(7).await.unwrap().as_deref(), Some("b"));
        assert_eq!(dict.lookup(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn decorate_falls_back_to_unknown() {
        let (dict, _tables, _dir) = create_test_dictionary();
        let id = dict.get_or_create("UA1").await.unwrap();
        let stored = |user_agent_id| StoredClick {
            short_code: "abc".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            ip: "1.2.3.4".into(),
            user_agent_id,
            referrer: String::new(),
            source_type: SourceType::Direct,
        };

        let clicks = dict.decorate(&[stored(id), stored(99)]).await.unwrap();
        assert_eq!(clicks[0].user_agent, "UA1");
        assert_eq!(clicks[1].user_agent, UNKNOWN_AGENT);
    }

    #[tokio::test]
    async fn absorb_keeps_existing_ids_and_writes_everything() {
        let (dict, tables, _dir) = create_test_dictionary();
        dict.get_or_create("old").await.unwrap();

        let ids = dict.absorb(["new", "old", "new", "other"]).await.unwrap();
        assert_eq!(ids["old"], 1);
        assert_eq!(ids["new"], 2);
        assert_eq!(ids["other"], 3);

        let rows: Vec<UserAgentEntry> = tables.read_all(UserAgentEntry::FILE).await.unwrap();
        let agents: Vec<_> = rows.iter().map(|r| r.user_agent.as_str()).collect();
        assert_eq!(agents, ["old", "new", "other"]);
    }
}
