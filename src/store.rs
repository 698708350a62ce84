//! The store: one handle over every table, built once per process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::clicks::ClickLedger;
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::models::{UrlRecord, UserAccount};
use crate::rate_limit::{self, RateLimiter};
use crate::stats::{self, ClickStats, PageRequest, RecentClick};
use crate::table::TableStore;
use crate::urls::{CreatedUrl, NewUrl, UrlDirectory, UrlSettings};
use crate::user_agents::UserAgentDictionary;
use crate::users::UserDirectory;
use crate::visit::ClientInfo;

const RECENT_CLICKS: usize = 10;

/// A URL with its click totals, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlWithStats {
    #[serde(flatten)]
    pub url: UrlRecord,
    pub click_count: u64,
    pub unique_visitors: u64,
}

/// Detail view of one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlStats {
    pub url: UrlRecord,
    #[serde(flatten)]
    pub stats: ClickStats,
    pub recent_clicks: Vec<RecentClick>,
}

pub struct Store {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    dictionary: Arc<UserAgentDictionary>,
    ledger: Arc<ClickLedger>,
    urls: UrlDirectory,
    users: UserDirectory,
    limiter: RateLimiter,
}

impl Store {
    pub fn open(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_users(config, clock.clone(), |tables| {
            UserDirectory::new(tables, clock)
        })
    }

    /// Build with a custom user directory (e.g. cheaper password hashing).
    pub fn with_users<F>(config: StoreConfig, clock: Arc<dyn Clock>, users: F) -> Self
    where
        F: FnOnce(Arc<TableStore>) -> UserDirectory,
    {
        let tables = Arc::new(TableStore::new(&config.data_dir));
        let dictionary = Arc::new(UserAgentDictionary::new(tables.clone()));
        let ledger = Arc::new(ClickLedger::new(
            tables.clone(),
            dictionary.clone(),
            clock.clone(),
        ));
        let urls = UrlDirectory::new(
            tables.clone(),
            ledger.clone(),
            clock.clone(),
            UrlSettings {
                base_url: config.base_url.clone(),
                code_length: config.short_code_length,
                max_attempts: config.short_code_max_attempts,
            },
        );

        Self {
            users: users(tables),
            config,
            clock,
            dictionary,
            ledger,
            urls,
            limiter: RateLimiter::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn urls(&self) -> &UrlDirectory {
        &self.urls
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn clicks(&self) -> &ClickLedger {
        &self.ledger
    }

    pub fn user_agents(&self) -> &UserAgentDictionary {
        &self.dictionary
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn default_page(&self) -> PageRequest {
        PageRequest {
            offset: 0,
            limit: self.config.stats_page_limit.max(1),
        }
    }

    /// Check the click table layout and migrate it now rather than on the
    /// first request. Returns the number of clicks on record.
    pub async fn migrate(&self) -> Result<usize> {
        let clicks = self.ledger.ensure_loaded().await?;
        tracing::info!("Click ledger ready with {} click(s)", clicks);
        Ok(clicks)
    }

    // ── Redirect path ──────────────────────────────────────────────────────

    /// Target URL for `short_code`, recording the visit on the way.
    ///
    /// A failure to record the click is logged and otherwise ignored: a broken
    /// analytics write must never stop the redirect.
    pub async fn resolve_and_track(
        &self,
        short_code: &str,
        client: &ClientInfo,
        via_qr: bool,
    ) -> Result<Option<String>> {
        let Some(target) = self.urls.resolve_target(short_code).await? else {
            return Ok(None);
        };

        if let Err(e) = self
            .ledger
            .record_click(client.click_for(short_code, via_qr))
            .await
        {
            tracing::warn!("Failed to record click for {}: {}", short_code, e);
        }
        Ok(Some(target))
    }

    // ── Analytics ──────────────────────────────────────────────────────────

    /// Aggregated stats for a code, whether or not a URL exists for it.
    pub async fn click_stats(&self, short_code: &str, page: PageRequest) -> Result<ClickStats> {
        let clicks = self.ledger.get_clicks(Some(short_code)).await?;
        Ok(stats::aggregate(
            short_code,
            &clicks,
            self.clock.today(),
            page,
            &self.config.api_base,
        ))
    }

    /// Stats for an existing URL; `NotFound` if there is none.
    pub async fn url_stats(&self, short_code: &str, page: Option<PageRequest>) -> Result<UrlStats> {
        let url = self
            .urls
            .get_url_by_short_code(short_code)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("short code '{short_code}'")))?;

        let clicks = self.ledger.get_clicks(Some(short_code)).await?;
        let page = page.unwrap_or_else(|| self.default_page());

        Ok(UrlStats {
            url,
            stats: stats::aggregate(
                short_code,
                &clicks,
                self.clock.today(),
                page,
                &self.config.api_base,
            ),
            recent_clicks: stats::recent_clicks(&clicks, RECENT_CLICKS),
        })
    }

    /// Listing with click totals, for one owner or for everyone.
    pub async fn urls_with_stats(&self, owner: Option<&str>) -> Result<Vec<UrlWithStats>> {
        let urls = match owner {
            Some(owner) => self.urls.get_user_urls(owner).await?,
            None => self.urls.get_all_urls().await?,
        };
        let clicks = self.ledger.get_clicks(None).await?;

        let mut totals: HashMap<&str, (u64, HashSet<&str>)> = HashMap::new();
        for click in &clicks {
            let entry = totals.entry(click.short_code.as_str()).or_default();
            entry.0 += 1;
            entry.1.insert(click.ip.as_str());
        }

        Ok(urls
            .into_iter()
            .map(|url| {
                let (click_count, unique_visitors) = totals
                    .get(url.short_code.as_str())
                    .map(|(count, ips)| (*count, ips.len() as u64))
                    .unwrap_or((0, 0));
                UrlWithStats {
                    url,
                    click_count,
                    unique_visitors,
                }
            })
            .collect())
    }

    // ── Rate-limited entry points ──────────────────────────────────────────

    /// Authenticate, allowing a limited number of attempts per client IP.
    pub async fn login(&self, ip: &str, username: &str, password: &str) -> Result<UserAccount> {
        let key = format!("login:{ip}");
        if !self.limiter.check(&key, rate_limit::LOGIN) {
            tracing::warn!("Login rate limit hit for {}", ip);
            return Err(StoreError::rate_limited("too many login attempts, try again later"));
        }

        let user = self.users.authenticate(username, password).await?;
        self.limiter.reset(&key);
        Ok(user)
    }

    /// Create a short URL, limited per creating user.
    pub async fn create_url(&self, new: NewUrl) -> Result<CreatedUrl> {
        let key = format!("create-url:{}", new.created_by.trim());
        if !self.limiter.check(&key, rate_limit::CREATE_URL) {
            tracing::warn!("URL creation rate limit hit for {}", new.created_by);
            return Err(StoreError::rate_limited("too many new URLs, try again later"));
        }
        self.urls.create_short_url(new).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::Role;
    use crate::password::PasswordHasher;
    use argon2::Params;
    use chrono::{TimeZone, Utc};
    use http::HeaderMap;
    use tempfile::TempDir;

    fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let users_clock = clock.clone();
        let store = Store::with_users(StoreConfig::new(dir.path()), clock, move |tables| {
            UserDirectory::with_hasher(
                tables,
                users_clock,
                PasswordHasher::with_params(Params::new(1024, 1, 1, None).unwrap()),
            )
        });
        (store, dir)
    }

    fn visitor(ip: &str) -> ClientInfo {
        ClientInfo {
            ip: ip.into(),
            ..ClientInfo::from_headers(&HeaderMap::new(), None)
        }
    }

    fn new_url(code: &str) -> NewUrl {
        NewUrl {
            original_url: "https://example.com".into(),
            custom_code: Some(code.into()),
            title: None,
            created_by: "alice".into(),
        }
    }

    #[tokio::test]
    async fn unknown_code_is_not_tracked() {
        let (store, _dir) = open_store();
        let target = store.resolve_and_track("nope", &visitor("1.1.1.1"), false).await.unwrap();
        assert_eq!(target, None);
        assert!(store.clicks().get_clicks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn url_stats_is_not_found_for_missing_url() {
        let (store, _dir) = open_store();
        let err = store.url_stats("nope", None).await.unwrap_err();
        assert_eq!(err.status_code(), 404);

        let zero = store.click_stats("nope", PageRequest::default()).await.unwrap();
        assert_eq!(zero.total_clicks, 0);
    }

    #[tokio::test]
    async fn listing_carries_click_totals() {
        let (store, _dir) = open_store();
        store.create_url(new_url("one")).await.unwrap();
        store.create_url(new_url("two")).await.unwrap();
        for ip in ["1.1.1.1", "1.1.1.1", "2.2.2.2"] {
            store.resolve_and_track("one", &visitor(ip), false).await.unwrap();
        }

        let listed = store.urls_with_stats(Some("alice")).await.unwrap();
        let one = listed.iter().find(|u| u.url.short_code == "one").unwrap();
        let two = listed.iter().find(|u| u.url.short_code == "two").unwrap();
        assert_eq!((one.click_count, one.unique_visitors), (3, 2));
        assert_eq!((two.click_count, two.unique_visitors), (0, 0));

        let json = serde_json::to_value(one).unwrap();
        assert_eq!(json["shortCode"], "one");
        assert_eq!(json["clickCount"], 3);
    }

    #[tokio::test]
    async fn url_creation_is_rate_limited_per_user() {
        let (store, _dir) = open_store();
        for i in 0..rate_limit::CREATE_URL.max {
            store.create_url(new_url(&format!("code{i}"))).await.unwrap();
        }
        let err = store.create_url(new_url("onemore")).await.unwrap_err();
        assert_eq!(err.status_code(), 429);

        let mut other = new_url("bobs");
        other.created_by = "bob".into();
        assert!(store.create_url(other).await.is_ok());
    }

    #[tokio::test]
    async fn login_is_rate_limited_per_ip() {
        let (store, _dir) = open_store();
        store.users().create_user("alice", "secret1", Role::User).await.unwrap();

        for _ in 0..rate_limit::LOGIN.max {
            assert!(store.login("9.9.9.9", "alice", "wrong!").await.is_err());
        }
        let err = store.login("9.9.9.9", "alice", "secret1").await.unwrap_err();
        assert!(matches!(err, StoreError::RateLimited(_)));

        assert!(store.login("8.8.8.8", "alice", "secret1").await.is_ok());
    }
}
