use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{Record, Row};

/// Stored timestamp format: RFC 3339, UTC, millisecond precision.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp; `None` for blank or malformed cells.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Calendar day (UTC) of a stored timestamp. Falls back to the text before
/// `T` so a timestamp with a bad time part still lands on its day.
pub fn timestamp_day(raw: &str) -> Option<NaiveDate> {
    if let Some(at) = parse_timestamp(raw) {
        return Some(at.date_naive());
    }
    let date_part = raw.trim().split('T').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

// ── Enums ──────────────────────────────────────────────────────────────────

/// Where a click came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SourceType {
    Website,
    #[default]
    Direct,
    QrCode,
    /// Any value this build does not know, kept verbatim.
    Other(String),
}

impl SourceType {
    pub fn as_str(&self) -> &str {
        match self {
            SourceType::Website => "website",
            SourceType::Direct => "direct",
            SourceType::QrCode => "qr-code",
            SourceType::Other(raw) => raw,
        }
    }

    /// QR scans win; otherwise a referrer means another website sent the visitor.
    pub fn classify(via_qr: bool, referrer: &str) -> Self {
        if via_qr {
            SourceType::QrCode
        } else if !referrer.trim().is_empty() {
            SourceType::Website
        } else {
            SourceType::Direct
        }
    }
}

impl From<&str> for SourceType {
    fn from(raw: &str) -> Self {
        match raw {
            "website" => SourceType::Website,
            "direct" => SourceType::Direct,
            "qr-code" => SourceType::QrCode,
            other => SourceType::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SourceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SourceType::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    /// Anything other than `admin` is a regular user.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::User
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── urls.csv ───────────────────────────────────────────────────────────────

/// A shortened URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlRecord {
    pub short_code: String,
    pub original_url: String,
    pub title: Option<String>,
    pub created_at: String,
    pub created_by: String,
}

impl UrlRecord {
    pub fn created_at_time(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

impl Record for UrlRecord {
    const FILE: &'static str = "urls.csv";
    const FIELDS: &'static [&'static str] =
        &["shortCode", "originalUrl", "title", "createdAt", "createdBy"];

    fn values(&self) -> Vec<String> {
        vec![
            self.short_code.clone(),
            self.original_url.clone(),
            self.title.clone().unwrap_or_default(),
            self.created_at.clone(),
            self.created_by.clone(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            short_code: row.get("shortCode").to_owned(),
            original_url: row.get("originalUrl").to_owned(),
            title: row.get_opt("title").map(str::to_owned),
            created_at: row.get("createdAt").to_owned(),
            created_by: row.get("createdBy").to_owned(),
        }
    }
}

// ── clicks.csv ─────────────────────────────────────────────────────────────

/// One click as stored: the user agent is an id into `user-agents.csv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClick {
    pub short_code: String,
    pub timestamp: String,
    pub ip: String,
    pub user_agent_id: u32,
    pub referrer: String,
    pub source_type: SourceType,
}

impl Record for StoredClick {
    const FILE: &'static str = "clicks.csv";
    const FIELDS: &'static [&'static str] = &[
        "shortCode",
        "timestamp",
        "ip",
        "userAgentId",
        "referrer",
        "sourceType",
    ];

    fn values(&self) -> Vec<String> {
        vec![
            self.short_code.clone(),
            self.timestamp.clone(),
            self.ip.clone(),
            self.user_agent_id.to_string(),
            self.referrer.clone(),
            self.source_type.to_string(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            short_code: row.get("shortCode").to_owned(),
            timestamp: row.get("timestamp").to_owned(),
            ip: row.get("ip").to_owned(),
            user_agent_id: row.parse_or("userAgentId", 0),
            referrer: row.get("referrer").to_owned(),
            source_type: SourceType::from(row.get("sourceType")),
        }
    }
}

/// A click with its user-agent string resolved.
///
/// Also the row type of the legacy wide click table, which stored the raw
/// `userAgent` string in every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickRecord {
    pub short_code: String,
    pub timestamp: String,
    pub ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub source_type: SourceType,
}

impl ClickRecord {
    /// UTC calendar day of the click.
    pub fn day(&self) -> Option<NaiveDate> {
        timestamp_day(&self.timestamp)
    }
}

impl Record for ClickRecord {
    const FILE: &'static str = "clicks.csv";
    const FIELDS: &'static [&'static str] = &[
        "shortCode",
        "timestamp",
        "ip",
        "userAgent",
        "referrer",
        "sourceType",
    ];

    fn values(&self) -> Vec<String> {
        vec![
            self.short_code.clone(),
            self.timestamp.clone(),
            self.ip.clone(),
            self.user_agent.clone(),
            self.referrer.clone(),
            self.source_type.to_string(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            short_code: row.get("shortCode").to_owned(),
            timestamp: row.get("timestamp").to_owned(),
            ip: row.get("ip").to_owned(),
            user_agent: row.get("userAgent").to_owned(),
            referrer: row.get("referrer").to_owned(),
            source_type: SourceType::from(row.get("sourceType")),
        }
    }
}

/// Input for recording a visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClick {
    pub short_code: String,
    pub ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub source_type: SourceType,
}

// ── user-agents.csv ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentEntry {
    pub id: u32,
    pub user_agent: String,
}

impl Record for UserAgentEntry {
    const FILE: &'static str = "user-agents.csv";
    const FIELDS: &'static [&'static str] = &["id", "userAgent"];

    fn values(&self) -> Vec<String> {
        vec![self.id.to_string(), self.user_agent.clone()]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            id: row.parse_or("id", 0),
            user_agent: row.get("userAgent").to_owned(),
        }
    }
}

// ── stats.csv ──────────────────────────────────────────────────────────────

/// Per-day roll-up for one short code, recomputed from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub date: String,
    pub short_code: String,
    pub clicks: u64,
    pub unique_ips: u64,
}

impl Record for DailyStat {
    const FILE: &'static str = "stats.csv";
    const FIELDS: &'static [&'static str] = &["date", "shortCode", "clicks", "uniqueIps"];

    fn values(&self) -> Vec<String> {
        vec![
            self.date.clone(),
            self.short_code.clone(),
            self.clicks.to_string(),
            self.unique_ips.to_string(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            date: row.get("date").to_owned(),
            short_code: row.get("shortCode").to_owned(),
            clicks: row.parse_or("clicks", 0),
            unique_ips: row.parse_or("uniqueIps", 0),
        }
    }
}

// ── users.csv ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub username: String,
    /// `hex(salt):hex(key)`
    #[serde(skip_serializing)]
    pub password: String,
    pub role: Role,
    pub created_at: String,
    pub active: bool,
}

impl UserAccount {
    pub fn is_active_admin(&self) -> bool {
        self.active && self.role == Role::Admin
    }
}

impl Record for UserAccount {
    const FILE: &'static str = "users.csv";
    const FIELDS: &'static [&'static str] = &["username", "password", "role", "createdAt", "active"];

    fn values(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.password.clone(),
            self.role.to_string(),
            self.created_at.clone(),
            self.active.to_string(),
        ]
    }

    fn from_row(row: &Row<'_>) -> Self {
        Self {
            username: row.get("username").to_owned(),
            password: row.get("password").to_owned(),
            role: Role::parse(row.get("role")),
            created_at: row.get("createdAt").to_owned(),
            // Only an explicit "true" counts as active.
            active: row.get("active").trim() == "true",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, header_record};
    use chrono::TimeZone;

    #[test]
    fn source_type_classification() {
        assert_eq!(SourceType::classify(true, "https://a.example"), SourceType::QrCode);
        assert_eq!(SourceType::classify(false, "https://a.example"), SourceType::Website);
        assert_eq!(SourceType::classify(false, ""), SourceType::Direct);
        assert_eq!(SourceType::classify(false, "   "), SourceType::Direct);
    }

    #[test]
    fn unknown_source_type_is_preserved() {
        let parsed = SourceType::from("newsletter");
        assert_eq!(parsed, SourceType::Other("newsletter".into()));
        assert_eq!(parsed.as_str(), "newsletter");
        assert_eq!(serde_json::to_string(&SourceType::QrCode).unwrap(), "\"qr-code\"");
    }

    #[test]
    fn timestamps_use_millisecond_utc() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 58).unwrap();
        let raw = format_timestamp(at);
        assert_eq!(raw, "2024-03-09T23:59:58.000Z");
        assert_eq!(parse_timestamp(&raw), Some(at));
    }

    #[test]
    fn day_is_taken_in_utc() {
        assert_eq!(
            timestamp_day("2024-03-09T23:30:00-02:00"),
            NaiveDate::from_ymd_opt(2024, 3, 10)
        );
        assert_eq!(
            timestamp_day("2024-03-09Tgarbage"),
            NaiveDate::from_ymd_opt(2024, 3, 9)
        );
        assert_eq!(timestamp_day("not a date"), None);
    }

    #[test]
    fn empty_title_round_trips_as_none() {
        let headers = header_record(UrlRecord::FIELDS);
        let record = UrlRecord {
            short_code: "abc123".into(),
            original_url: "https://example.com/?a=1,b=2".into(),
            title: None,
            created_at: "2024-01-01T00:00:00.000Z".into(),
            created_by: "alice".into(),
        };
        let line = encode(&record, &headers).unwrap();
        let back: UrlRecord = decode(&line, &headers).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn user_active_flag_requires_literal_true() {
        let headers = header_record(UserAccount::FIELDS);
        let active: UserAccount = decode("bob,x:y,admin,2024-01-01,true", &headers).unwrap();
        let inactive: UserAccount = decode("bob,x:y,admin,2024-01-01,", &headers).unwrap();
        assert!(active.is_active_admin());
        assert!(!inactive.active);
        assert_eq!(inactive.role, Role::Admin);
    }

    #[test]
    fn bad_numeric_cells_decode_to_zero() {
        let headers = header_record(StoredClick::FIELDS);
        let click: StoredClick =
            decode("abc,2024-01-01T00:00:00.000Z,1.2.3.4,oops,,direct", &headers).unwrap();
        assert_eq!(click.user_agent_id, 0);
        assert_eq!(click.source_type, SourceType::Direct);
    }

    #[test]
    fn password_is_never_serialized() {
        let user = UserAccount {
            username: "alice".into(),
            password: "secret".into(),
            role: Role::User,
            created_at: String::new(),
            active: true,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"role\":\"user\""));
    }
}
