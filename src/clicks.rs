//! Click ledger: the append-only log of visits plus its per-day roll-up.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::codec::Record;
use crate::error::Result;
use crate::migration;
use crate::models::{format_timestamp, timestamp_day, ClickRecord, DailyStat, NewClick, StoredClick};
use crate::table::TableStore;
use crate::user_agents::UserAgentDictionary;

/// Owns `clicks.csv` and `stats.csv`.
///
/// Lock order is ledger first, dictionary second; nothing in the dictionary
/// calls back into the ledger.
pub struct ClickLedger {
    tables: Arc<TableStore>,
    dictionary: Arc<UserAgentDictionary>,
    clock: Arc<dyn Clock>,
    clicks: Mutex<Option<Vec<StoredClick>>>,
}

impl ClickLedger {
    pub fn new(
        tables: Arc<TableStore>,
        dictionary: Arc<UserAgentDictionary>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tables,
            dictionary,
            clock,
            clicks: Mutex::new(None),
        }
    }

    /// The cached ledger, loading (and migrating) it on first use.
    async fn loaded(&self) -> Result<MappedMutexGuard<'_, Vec<StoredClick>>> {
        let mut guard = self.clicks.lock().await;
        if guard.is_none() {
            let clicks = migration::load_clicks(&self.tables, &self.dictionary).await?;
            tracing::debug!("Loaded {} click(s)", clicks.len());
            *guard = Some(clicks);
        }
        Ok(MutexGuard::map(guard, |slot| slot.get_or_insert_with(Vec::new)))
    }

    /// Load the ledger now instead of on the first request.
    pub async fn ensure_loaded(&self) -> Result<usize> {
        Ok(self.loaded().await?.len())
    }

    /// Append one click stamped with the current time.
    ///
    /// The click is durable once this returns `Ok`. Refreshing the day's
    /// roll-up afterwards is best effort and only logged on failure.
    pub async fn record_click(&self, click: NewClick) -> Result<StoredClick> {
        let mut clicks = self.loaded().await?;
        let user_agent_id = self.dictionary.get_or_create(&click.user_agent).await?;

        let stored = StoredClick {
            short_code: click.short_code,
            timestamp: format_timestamp(self.clock.now()),
            ip: click.ip,
            user_agent_id,
            referrer: click.referrer,
            source_type: click.source_type,
        };
        self.tables
            .append(StoredClick::FILE, &stored, StoredClick::FIELDS)
            .await?;
        clicks.push(stored.clone());

        let Some(day) = timestamp_day(&stored.timestamp) else {
            return Ok(stored);
        };
        if let Err(e) = self.upsert_daily_stat(&clicks, &stored.short_code, day).await {
            tracing::warn!(
                "Failed to refresh daily stats for {} on {}: {}",
                stored.short_code,
                day,
                e
            );
        }

        Ok(stored)
    }

    /// Whether any click is filed under `short_code`.
    pub async fn has_clicks(&self, short_code: &str) -> Result<bool> {
        let clicks = self.loaded().await?;
        Ok(clicks.iter().any(|c| c.short_code == short_code))
    }

    /// Every click, or only those for `short_code`, with user agents resolved.
    pub async fn get_clicks(&self, short_code: Option<&str>) -> Result<Vec<ClickRecord>> {
        let clicks = self.loaded().await?;
        let selected: Vec<StoredClick> = match short_code {
            Some(code) => clicks.iter().filter(|c| c.short_code == code).cloned().collect(),
            None => clicks.clone(),
        };
        drop(clicks);
        self.dictionary.decorate(&selected).await
    }

    /// Move every click and daily stat row from `old` to `new`, preserving
    /// row order. Returns the number of clicks moved.
    pub async fn rename_short_code(&self, old: &str, new: &str) -> Result<usize> {
        let mut clicks = self.loaded().await?;

        let mut moved = 0;
        let updated: Vec<StoredClick> = clicks
            .iter()
            .cloned()
            .map(|mut click| {
                if click.short_code == old {
                    click.short_code = new.to_owned();
                    moved += 1;
                }
                click
            })
            .collect();

        if moved > 0 {
            self.tables
                .write_all(StoredClick::FILE, &updated, StoredClick::FIELDS)
                .await?;
            *clicks = updated;
        }

        // Clicks are already moved. Stale stats are recomputed by the next
        // click recorded for that day.
        if let Err(e) = self.move_daily_stats(old, new).await {
            tracing::warn!("Failed to move daily stats from {} to {}: {}", old, new, e);
        }

        tracing::info!("Moved {} click(s) from {} to {}", moved, old, new);
        Ok(moved)
    }

    async fn move_daily_stats(&self, old: &str, new: &str) -> Result<()> {
        let mut stats: Vec<DailyStat> = self.tables.read_all(DailyStat::FILE).await?;
        let mut moved = false;
        for stat in stats.iter_mut().filter(|s| s.short_code == old) {
            stat.short_code = new.to_owned();
            moved = true;
        }
        if moved {
            self.tables
                .write_all(DailyStat::FILE, &stats, DailyStat::FIELDS)
                .await?;
        }
        Ok(())
    }

    /// Stored roll-up rows for one short code, oldest day first.
    pub async fn daily_stats(&self, short_code: &str) -> Result<Vec<DailyStat>> {
        let mut rows: Vec<DailyStat> = self
            .tables
            .read_all::<DailyStat>(DailyStat::FILE)
            .await?
            .into_iter()
            .filter(|s| s.short_code == short_code)
            .collect();
        rows.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(rows)
    }

    /// Recompute the (day, code) row from the ledger rather than incrementing,
    /// so unique IPs stay exact.
    async fn upsert_daily_stat(&self, clicks: &[StoredClick], short_code: &str, day: NaiveDate) -> Result<()> {
        let mut total = 0u64;
        let mut ips = HashSet::new();
        for click in clicks
            .iter()
            .filter(|c| c.short_code == short_code && timestamp_day(&c.timestamp) == Some(day))
        {
            total += 1;
            ips.insert(click.ip.as_str());
        }

        let fresh = DailyStat {
            date: day.format("%Y-%m-%d").to_string(),
            short_code: short_code.to_owned(),
            clicks: total,
            unique_ips: ips.len() as u64,
        };

        let mut stats: Vec<DailyStat> = self.tables.read_all(DailyStat::FILE).await?;
        match stats
            .iter_mut()
            .find(|s| s.date == fresh.date && s.short_code == fresh.short_code)
        {
            Some(existing) => *existing = fresh,
            None => stats.push(fresh),
        }
        self.tables
            .write_all(DailyStat::FILE, &stats, DailyStat::FIELDS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::SourceType;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        ledger: ClickLedger,
        tables: Arc<TableStore>,
        clock: Arc<FixedClock>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tables = Arc::new(TableStore::new(dir.path()));
        let dictionary = Arc::new(UserAgentDictionary::new(tables.clone()));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
        ));
        let ledger = ClickLedger::new(tables.clone(), dictionary, clock.clone());
        Fixture {
            ledger,
            tables,
            clock,
            _dir: dir,
        }
    }

    fn visit(code: &str, ip: &str, ua: &str) -> NewClick {
        NewClick {
            short_code: code.into(),
            ip: ip.into(),
            user_agent: ua.into(),
            referrer: String::new(),
            source_type: SourceType::Direct,
        }
    }

    #[tokio::test]
    async fn record_click_appends_and_decorates() {
        let fx = fixture();
        let stored = fx.ledger.record_click(visit("abc", "1.2.3.4", "UA1")).await.unwrap();
        assert_eq!(stored.timestamp, "2024-06-01T09:30:00.000Z");
        assert_eq!(stored.user_agent_id, 1);

        let clicks = fx.ledger.get_clicks(Some("abc")).await.unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].user_agent, "UA1");
        assert!(fx.ledger.get_clicks(Some("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_stat_is_recomputed_not_incremented() {
        let fx = fixture();
        fx.ledger.record_click(visit("abc", "1.1.1.1", "UA1")).await.unwrap();
        fx.ledger.record_click(visit("abc", "1.1.1.1", "UA2")).await.unwrap();
        fx.ledger.record_click(visit("abc", "2.2.2.2", "UA1")).await.unwrap();

        fx.clock.set(fx.clock.now() + Duration::days(1));
        fx.ledger.record_click(visit("abc", "3.3.3.3", "UA1")).await.unwrap();

        let stats = fx.ledger.daily_stats("abc").await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!((stats[0].date.as_str(), stats[0].clicks, stats[0].unique_ips), ("2024-06-01", 3, 2));
        assert_eq!((stats[1].date.as_str(), stats[1].clicks, stats[1].unique_ips), ("2024-06-02", 1, 1));
    }

    #[tokio::test]
    async fn rename_moves_clicks_and_stats_in_order() {
        let fx = fixture();
        fx.ledger.record_click(visit("old", "1.1.1.1", "A")).await.unwrap();
        fx.ledger.record_click(visit("keep", "9.9.9.9", "A")).await.unwrap();
        fx.ledger.record_click(visit("old", "2.2.2.2", "B")).await.unwrap();
        let before = fx.ledger.get_clicks(Some("old")).await.unwrap();

        let moved = fx.ledger.rename_short_code("old", "new").await.unwrap();
        assert_eq!(moved, 2);

        assert!(fx.ledger.get_clicks(Some("old")).await.unwrap().is_empty());
        let after = fx.ledger.get_clicks(Some("new")).await.unwrap();
        let ips: Vec<_> = after.iter().map(|c| c.ip.as_str()).collect();
        assert_eq!(ips, ["1.1.1.1", "2.2.2.2"]);
        assert_eq!(after.len(), before.len());

        assert!(fx.ledger.daily_stats("old").await.unwrap().is_empty());
        assert_eq!(fx.ledger.daily_stats("new").await.unwrap()[0].clicks, 2);
        assert_eq!(fx.ledger.get_clicks(Some("keep")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rename_of_unknown_code_leaves_files_alone() {
        let fx = fixture();
        fx.ledger.record_click(visit("abc", "1.1.1.1", "A")).await.unwrap();
        let before = std::fs::read_to_string(fx.tables.path(StoredClick::FILE)).unwrap();

        assert_eq!(fx.ledger.rename_short_code("nope", "other").await.unwrap(), 0);
        let after = std::fs::read_to_string(fx.tables.path(StoredClick::FILE)).unwrap();
        assert_eq!(before, after);
    }

    /// Reports the next day as "today" while `now` is still the last
    /// millisecond of the previous one.
    struct MidnightClock;

    impl Clock for MidnightClock {
        fn now(&self) -> chrono::DateTime<Utc> {
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap() + Duration::milliseconds(999)
        }

        fn today(&self) -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()
        }
    }

    #[tokio::test]
    async fn daily_stat_follows_the_click_timestamp() {
        let dir = TempDir::new().unwrap();
        let tables = Arc::new(TableStore::new(dir.path()));
        let dictionary = Arc::new(UserAgentDictionary::new(tables.clone()));
        let ledger = ClickLedger::new(tables, dictionary, Arc::new(MidnightClock));

        let stored = ledger.record_click(visit("abc", "1.1.1.1", "UA")).await.unwrap();
        assert_eq!(stored.timestamp, "2024-06-01T23:59:59.999Z");

        let stats = ledger.daily_stats("abc").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].date.as_str(), stats[0].clicks), ("2024-06-01", 1));
    }

    #[tokio::test]
    async fn rename_moves_clicks_even_if_stats_are_unwritable() {
        let fx = fixture();
        fx.ledger.record_click(visit("old", "1.1.1.1", "A")).await.unwrap();

        let stats = fx.tables.path(DailyStat::FILE);
        std::fs::remove_file(&stats).unwrap();
        std::fs::create_dir(&stats).unwrap();

        assert_eq!(fx.ledger.rename_short_code("old", "new").await.unwrap(), 1);
        assert!(fx.ledger.get_clicks(Some("old")).await.unwrap().is_empty());
        assert_eq!(fx.ledger.get_clicks(Some("new")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn has_clicks_sees_codes_without_urls() {
        let fx = fixture();
        assert!(!fx.ledger.has_clicks("abc").await.unwrap());
        fx.ledger.record_click(visit("abc", "1.1.1.1", "A")).await.unwrap();
        assert!(fx.ledger.has_clicks("abc").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_survives_a_reload() {
        let fx = fixture();
        fx.ledger.record_click(visit("abc", "1.1.1.1", "UA, with comma")).await.unwrap();

        let dictionary = Arc::new(UserAgentDictionary::new(fx.tables.clone()));
        let reloaded = ClickLedger::new(fx.tables.clone(), dictionary, fx.clock.clone());
        let clicks = reloaded.get_clicks(None).await.unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].user_agent, "UA, with comma");
    }
}
