//! Click-table schema detection and the wide-to-normalized migration.

use csv::StringRecord;

use crate::codec::Record;
use crate::error::{Result, StoreError};
use crate::models::{ClickRecord, StoredClick};
use crate::table::{RawTable, TableStore};
use crate::user_agents::UserAgentDictionary;

/// Known layouts of `clicks.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickSchema {
    /// `userAgentId` column pointing into `user-agents.csv`.
    Normalized,
    /// Raw `userAgent` string in every row.
    LegacyRawAgent,
}

impl ClickSchema {
    /// Classify a header row. A missing file counts as normalized; anything
    /// that is neither layout is rejected.
    pub fn detect(headers: Option<&StringRecord>) -> Result<Self> {
        let Some(headers) = headers else {
            return Ok(ClickSchema::Normalized);
        };
        let has = |name: &str| headers.iter().any(|h| h == name);

        if has("userAgentId") {
            Ok(ClickSchema::Normalized)
        } else if has("userAgent") {
            Ok(ClickSchema::LegacyRawAgent)
        } else {
            Err(StoreError::UnsupportedSchema {
                file: StoredClick::FILE.to_owned(),
                header: headers.iter().collect::<Vec<_>>().join(","),
            })
        }
    }
}

/// Load `clicks.csv`, migrating the legacy layout first if that is what is
/// on disk. Safe to call again on an already migrated file.
pub async fn load_clicks(
    tables: &TableStore,
    dictionary: &UserAgentDictionary,
) -> Result<Vec<StoredClick>> {
    let raw = tables.read_raw(StoredClick::FILE).await?;

    match ClickSchema::detect(raw.as_ref().map(|r| &r.headers))? {
        ClickSchema::Normalized => Ok(raw.map(|r| r.decode()).unwrap_or_default()),
        ClickSchema::LegacyRawAgent => match raw {
            Some(raw) => migrate_legacy(tables, dictionary, &raw).await,
            None => Ok(Vec::new()),
        },
    }
}

/// Rewrite a wide click table into the normalized one.
///
/// The dictionary is written in full before the click file is replaced, so an
/// interrupted run leaves the legacy file intact and the next run picks up
/// where it stopped.
async fn migrate_legacy(
    tables: &TableStore,
    dictionary: &UserAgentDictionary,
    raw: &RawTable,
) -> Result<Vec<StoredClick>> {
    tracing::info!("Migrating click data to the normalized user agent layout");
    let legacy: Vec<ClickRecord> = raw.decode();

    let ids = dictionary
        .absorb(legacy.iter().map(|click| click.user_agent.as_str()))
        .await
        .map_err(|e| migration_error(&e))?;

    let mut migrated = Vec::with_capacity(legacy.len());
    for click in legacy {
        let Some(user_agent_id) = ids.get(&click.user_agent).copied() else {
            return Err(StoreError::Migration {
                file: StoredClick::FILE.to_owned(),
                reason: format!("no id assigned for user agent {:?}", click.user_agent),
            });
        };
        migrated.push(StoredClick {
            short_code: click.short_code,
            timestamp: click.timestamp,
            ip: click.ip,
            user_agent_id,
            referrer: click.referrer,
            source_type: click.source_type,
        });
    }

    tables
        .write_all(StoredClick::FILE, &migrated, StoredClick::FIELDS)
        .await
        .map_err(|e| migration_error(&e))?;

    tracing::info!("Migrated {} unique user agents", ids.len());
    Ok(migrated)
}

fn migration_error(cause: &StoreError) -> StoreError {
    StoreError::Migration {
        file: StoredClick::FILE.to_owned(),
        reason: cause.to_string(),
    }
}
