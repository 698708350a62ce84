//! URL directory: `urls.csv`, short-code generation and the rename cascade.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::cache::LinkCache;
use crate::clicks::ClickLedger;
use crate::clock::Clock;
use crate::codec::Record;
use crate::error::{Result, StoreError};
use crate::models::{format_timestamp, UrlRecord};
use crate::table::TableStore;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CUSTOM_CODE_MIN: usize = 3;
const CUSTOM_CODE_MAX: usize = 20;

/// Settings the directory needs from the store configuration.
#[derive(Debug, Clone)]
pub struct UrlSettings {
    /// Public prefix of short URLs, without a trailing slash.
    pub base_url: String,
    pub code_length: usize,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NewUrl {
    pub original_url: String,
    pub custom_code: Option<String>,
    pub title: Option<String>,
    pub created_by: String,
}

/// Edit of an existing URL. `title: None` keeps the current title and
/// `Some("")` clears it.
#[derive(Debug, Clone, Default)]
pub struct UrlUpdate {
    pub original_url: String,
    pub title: Option<String>,
    pub new_short_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUrl {
    #[serde(flatten)]
    pub url: UrlRecord,
    pub short_url: String,
}

pub struct UrlDirectory {
    tables: Arc<TableStore>,
    ledger: Arc<ClickLedger>,
    clock: Arc<dyn Clock>,
    cache: LinkCache,
    settings: UrlSettings,
    urls: Mutex<Option<Vec<UrlRecord>>>,
}

impl UrlDirectory {
    pub fn new(
        tables: Arc<TableStore>,
        ledger: Arc<ClickLedger>,
        clock: Arc<dyn Clock>,
        settings: UrlSettings,
    ) -> Self {
        Self {
            tables,
            ledger,
            clock,
            cache: LinkCache::new(),
            settings,
            urls: Mutex::new(None),
        }
    }

    async fn loaded(&self) -> Result<MappedMutexGuard<'_, Vec<UrlRecord>>> {
        let mut guard = self.urls.lock().await;
        if guard.is_none() {
            let urls: Vec<UrlRecord> = self.tables.read_all(UrlRecord::FILE).await?;
            self.cache.warm(
                urls.iter()
                    .map(|u| (u.short_code.clone(), u.original_url.clone())),
            );
            tracing::debug!("Loaded {} url(s)", urls.len());
            *guard = Some(urls);
        }
        Ok(MutexGuard::map(guard, |slot| slot.get_or_insert_with(Vec::new)))
    }

    pub fn short_url(&self, short_code: &str) -> String {
        format!("{}/{}", self.settings.base_url, short_code)
    }

    // ── Create ─────────────────────────────────────────────────────────────

    pub async fn create_short_url(&self, new: NewUrl) -> Result<CreatedUrl> {
        let original_url = validate_url(&new.original_url)?;
        let created_by = new.created_by.trim();
        if created_by.is_empty() {
            return Err(StoreError::validation("createdBy is required"));
        }

        let mut urls = self.loaded().await?;

        let short_code = match new.custom_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                validate_custom_code(code)?;
                if urls.iter().any(|u| u.short_code == code) {
                    return Err(StoreError::conflict(format!(
                        "short code '{code}' is already taken"
                    )));
                }
                code.to_owned()
            }
            _ => self.generate_code(&urls)?,
        };

        let record = UrlRecord {
            short_code,
            original_url,
            title: clean_title(new.title),
            created_at: format_timestamp(self.clock.now()),
            created_by: created_by.to_owned(),
        };

        self.tables
            .append(UrlRecord::FILE, &record, UrlRecord::FIELDS)
            .await?;
        urls.push(record.clone());
        self.cache.set(&record.short_code, &record.original_url);

        tracing::info!(
            "Created short code {} -> {} for {}",
            record.short_code,
            record.original_url,
            record.created_by
        );

        Ok(CreatedUrl {
            short_url: self.short_url(&record.short_code),
            url: record,
        })
    }

    /// Random code not present in `taken`, giving up after the configured
    /// number of attempts.
    fn generate_code(&self, taken: &[UrlRecord]) -> Result<String> {
        for _ in 0..self.settings.max_attempts {
            let code = random_code(self.settings.code_length);
            if !taken.iter().any(|u| u.short_code == code) {
                return Ok(code);
            }
        }
        Err(StoreError::CodeSpaceExhausted(self.settings.max_attempts))
    }

    // ── Read ───────────────────────────────────────────────────────────────

    pub async fn get_url_by_short_code(&self, short_code: &str) -> Result<Option<UrlRecord>> {
        let urls = self.loaded().await?;
        Ok(urls.iter().find(|u| u.short_code == short_code).cloned())
    }

    /// URLs created by `username`, newest first.
    pub async fn get_user_urls(&self, username: &str) -> Result<Vec<UrlRecord>> {
        let urls = self.loaded().await?;
        let mut owned: Vec<UrlRecord> = urls
            .iter()
            .filter(|u| u.created_by == username)
            .cloned()
            .collect();
        newest_first(&mut owned);
        Ok(owned)
    }

    /// Every URL, newest first.
    pub async fn get_all_urls(&self) -> Result<Vec<UrlRecord>> {
        let mut all = self.loaded().await?.clone();
        newest_first(&mut all);
        Ok(all)
    }

    /// Target for the redirect path, served from the cache.
    pub async fn resolve_target(&self, short_code: &str) -> Result<Option<String>> {
        if let Some(target) = self.cache.get(short_code) {
            return Ok(Some(target));
        }
        let urls = self.loaded().await?;
        Ok(urls
            .iter()
            .find(|u| u.short_code == short_code)
            .map(|u| u.original_url.clone()))
    }

    // ── Update ─────────────────────────────────────────────────────────────

    /// Change target and title, and optionally rename the code.
    ///
    /// A rename moves the code's clicks first and then rewrites `urls.csv`. If
    /// that rewrite fails the clicks are moved back before the error is
    /// returned. The new code must be free in both tables.
    pub async fn update_url(&self, short_code: &str, update: UrlUpdate) -> Result<UrlRecord> {
        let original_url = validate_url(&update.original_url)?;
        let mut urls = self.loaded().await?;

        let idx = urls
            .iter()
            .position(|u| u.short_code == short_code)
            .ok_or_else(|| StoreError::not_found(format!("short code '{short_code}'")))?;

        let rename_to = match update.new_short_code.as_deref().map(str::trim) {
            Some(new) if !new.is_empty() && new != short_code => {
                validate_custom_code(new)?;
                if urls.iter().any(|u| u.short_code == new) {
                    return Err(StoreError::conflict(format!(
                        "short code '{new}' is already taken"
                    )));
                }
                // Clicks left behind by a deleted URL would merge into ours.
                if self.ledger.has_clicks(new).await? {
                    return Err(StoreError::conflict(format!(
                        "short code '{new}' still has recorded clicks"
                    )));
                }
                Some(new.to_owned())
            }
            _ => None,
        };

        let mut updated = urls.clone();
        let record = &mut updated[idx];
        record.original_url = original_url;
        if let Some(title) = update.title {
            record.title = clean_title(Some(title));
        }
        if let Some(new) = &rename_to {
            record.short_code = new.clone();
        }
        let record = record.clone();

        if let Some(new) = &rename_to {
            self.ledger.rename_short_code(short_code, new).await?;
        }

        if let Err(e) = self
            .tables
            .write_all(UrlRecord::FILE, &updated, UrlRecord::FIELDS)
            .await
        {
            if let Some(new) = &rename_to {
                if let Err(undo) = self.ledger.rename_short_code(new, short_code).await {
                    tracing::error!(
                        "Could not move clicks back from {} to {}: {}",
                        new,
                        short_code,
                        undo
                    );
                }
            }
            return Err(e);
        }
        *urls = updated;

        if rename_to.is_some() {
            self.cache.rename(short_code, &record.short_code);
            tracing::info!("Renamed short code {} to {}", short_code, record.short_code);
        }
        self.cache.set(&record.short_code, &record.original_url);

        Ok(record)
    }

    /// Hand a URL over to another user.
    pub async fn change_owner(&self, short_code: &str, new_owner: &str) -> Result<UrlRecord> {
        let new_owner = new_owner.trim();
        if new_owner.is_empty() {
            return Err(StoreError::validation("new owner is required"));
        }

        let mut urls = self.loaded().await?;
        let mut updated = urls.clone();
        let record = updated
            .iter_mut()
            .find(|u| u.short_code == short_code)
            .ok_or_else(|| StoreError::not_found(format!("short code '{short_code}'")))?;
        record.created_by = new_owner.to_owned();
        let record = record.clone();

        self.tables
            .write_all(UrlRecord::FILE, &updated, UrlRecord::FIELDS)
            .await?;
        *urls = updated;

        tracing::info!("Moved {} to owner {}", short_code, new_owner);
        Ok(record)
    }

    // ── Delete ─────────────────────────────────────────────────────────────

    /// Remove the URL row. Its clicks stay in the ledger.
    pub async fn delete_url(&self, short_code: &str) -> Result<()> {
        let mut urls = self.loaded().await?;
        let remaining: Vec<UrlRecord> = urls
            .iter()
            .filter(|u| u.short_code != short_code)
            .cloned()
            .collect();

        if remaining.len() == urls.len() {
            return Err(StoreError::not_found(format!("short code '{short_code}'")));
        }

        self.tables
            .write_all(UrlRecord::FILE, &remaining, UrlRecord::FIELDS)
            .await?;
        *urls = remaining;
        self.cache.remove(short_code);

        tracing::info!("Deleted short code {}", short_code);
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Generate a random alphanumeric code of `len` characters.
fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// The trimmed URL if it parses as an absolute URL.
pub fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::validation("originalUrl is required"));
    }
    url::Url::parse(trimmed)
        .map_err(|e| StoreError::validation(format!("invalid URL '{trimmed}': {e}")))?;
    Ok(trimmed.to_owned())
}

pub fn validate_custom_code(code: &str) -> Result<()> {
    let len = code.chars().count();
    if !(CUSTOM_CODE_MIN..=CUSTOM_CODE_MAX).contains(&len) {
        return Err(StoreError::validation(format!(
            "short code must be {CUSTOM_CODE_MIN}-{CUSTOM_CODE_MAX} characters"
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StoreError::validation(
            "short code may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

fn clean_title(title: Option<String>) -> Option<String> {
    title
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
}

fn newest_first(urls: &mut [UrlRecord]) {
    urls.sort_by(|a, b| {
        b.created_at_time()
            .cmp(&a.created_at_time())
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}
