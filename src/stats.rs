//! Click analytics: totals, gap-filled day series, referrer and source
//! breakdowns, and page links over the day series.
//!
//! Everything here is pure; callers hand in the clicks and "today".

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::models::{parse_timestamp, ClickRecord};

pub const DEFAULT_PAGE_LIMIT: usize = 30;
pub const TOP_REFERRERS: usize = 10;
pub const DIRECT_REFERRER: &str = "Direct";

// ── Paging ─────────────────────────────────────────────────────────────────

/// Window over the day series. The offset is always a whole number of
/// pages so the page links describe the window that was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(StoreError::validation("limit must be at least 1"));
        }
        if offset % limit != 0 {
            return Err(StoreError::validation(format!(
                "offset {offset} is not a multiple of limit {limit}"
            )));
        }
        Ok(Self { offset, limit })
    }

    /// 1-based page number to offset.
    pub fn from_page(page: usize, limit: usize) -> Result<Self> {
        if page == 0 {
            return Err(StoreError::validation("page must be at least 1"));
        }
        let offset = (page - 1)
            .checked_mul(limit)
            .ok_or_else(|| StoreError::validation("page is out of range"))?;
        Self::new(offset, limit)
    }

    pub fn page(&self) -> usize {
        self.offset / self.limit + 1
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

// ── Response shapes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStats {
    pub date: String,
    pub clicks: u64,
    pub unique_visitors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferrerCount {
    pub referrer: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
    pub first: Link,
    pub url: Link,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickStats {
    pub total_clicks: u64,
    pub unique_visitors: u64,
    pub daily_stats: Vec<DayStats>,
    pub top_referrers: Vec<ReferrerCount>,
    pub source_breakdown: BTreeMap<String, u64>,
    pub has_more: bool,
    #[serde(rename = "_links")]
    pub links: StatsLinks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentClick {
    pub timestamp: String,
    pub source_type: String,
    pub referrer: String,
}

// ── Aggregation ────────────────────────────────────────────────────────────

/// Statistics for `short_code` over `clicks` (the code's clicks only).
///
/// A code without clicks gets zero totals and a one-day series for `today`;
/// whether the URL itself exists is the caller's business.
pub fn aggregate(
    short_code: &str,
    clicks: &[ClickRecord],
    today: NaiveDate,
    page: PageRequest,
    api_base: &str,
) -> ClickStats {
    let series = daily_series(clicks, today);
    let total_days = series.len();
    let has_more = page.offset.saturating_add(page.limit) < total_days;

    ClickStats {
        total_clicks: clicks.len() as u64,
        unique_visitors: unique_visitors(clicks),
        daily_stats: series.into_iter().skip(page.offset).take(page.limit).collect(),
        top_referrers: top_referrers(clicks, TOP_REFERRERS),
        source_breakdown: source_breakdown(clicks),
        has_more,
        links: links(api_base, short_code, page, has_more),
    }
}

pub fn unique_visitors(clicks: &[ClickRecord]) -> u64 {
    clicks.iter().map(|c| c.ip.as_str()).collect::<HashSet<_>>().len() as u64
}

/// One entry per day from the first day with clicks (or `today`) through
/// `max(today, last day)`, newest first. Days without clicks are zero.
pub fn daily_series(clicks: &[ClickRecord], today: NaiveDate) -> Vec<DayStats> {
    let mut per_day: BTreeMap<NaiveDate, (u64, HashSet<&str>)> = BTreeMap::new();
    for click in clicks {
        let Some(day) = click.day() else {
            tracing::warn!(
                "Click for {} has an unreadable timestamp {:?}; left out of the day series",
                click.short_code,
                click.timestamp
            );
            continue;
        };
        let entry = per_day.entry(day).or_default();
        entry.0 += 1;
        entry.1.insert(click.ip.as_str());
    }

    let start = per_day.keys().next().copied().unwrap_or(today).min(today);
    let end = per_day.keys().next_back().copied().unwrap_or(today).max(today);

    let mut series = Vec::new();
    let mut day = end;
    loop {
        let (clicks, unique) = per_day
            .get(&day)
            .map(|(count, ips)| (*count, ips.len() as u64))
            .unwrap_or((0, 0));
        series.push(DayStats {
            date: day.format("%Y-%m-%d").to_string(),
            clicks,
            unique_visitors: unique,
        });

        if day <= start {
            break;
        }
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    series
}

/// Referrer tally, most frequent first, empty referrer counted as
/// `Direct`. Ties keep first-seen order.
pub fn top_referrers(clicks: &[ClickRecord], n: usize) -> Vec<ReferrerCount> {
    let mut order: Vec<ReferrerCount> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for click in clicks {
        let referrer = match click.referrer.trim() {
            "" => DIRECT_REFERRER,
            other => other,
        };
        match index.get(referrer) {
            Some(&i) => order[i].count += 1,
            None => {
                index.insert(referrer, order.len());
                order.push(ReferrerCount {
                    referrer: referrer.to_owned(),
                    count: 1,
                });
            }
        }
    }

    // Stable sort keeps first-seen order among equal counts.
    order.sort_by(|a, b| b.count.cmp(&a.count));
    order.truncate(n);
    order
}

/// Histogram of source types over all given clicks.
pub fn source_breakdown(clicks: &[ClickRecord]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for click in clicks {
        *counts.entry(click.source_type.as_str().to_owned()).or_insert(0) += 1;
    }
    counts
}

/// The `n` newest clicks.
pub fn recent_clicks(clicks: &[ClickRecord], n: usize) -> Vec<RecentClick> {
    let mut sorted: Vec<&ClickRecord> = clicks.iter().collect();
    sorted.sort_by(|a, b| {
        parse_timestamp(&b.timestamp)
            .cmp(&parse_timestamp(&a.timestamp))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });

    sorted
        .into_iter()
        .take(n)
        .map(|click| RecentClick {
            timestamp: click.timestamp.clone(),
            source_type: click.source_type.to_string(),
            referrer: if click.referrer.trim().is_empty() {
                DIRECT_REFERRER.to_owned()
            } else {
                click.referrer.clone()
            },
        })
        .collect()
}

fn links(api_base: &str, short_code: &str, page: PageRequest, has_more: bool) -> StatsLinks {
    let url = format!("{api_base}/urls/{short_code}");
    let stats_page = |n: usize| Link {
        href: format!("{url}/stats?page={n}&limit={}", page.limit),
    };
    let current = page.page();

    StatsLinks {
        self_link: stats_page(current),
        first: stats_page(1),
        next: has_more.then(|| stats_page(current + 1)),
        prev: (page.offset > 0).then(|| stats_page(current - 1)),
        url: Link { href: url },
    }
}
