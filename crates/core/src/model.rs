use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One independently toggleable group of exported app data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCategory {
    Tasks,
    Courses,
    Events,
    Routines,
    Subscriptions,
    PomodoroSessions,
    ValueDays,
    Preferences,
}

impl BackupCategory {
    pub const ALL: [BackupCategory; 8] = [
        BackupCategory::Tasks,
        BackupCategory::Courses,
        BackupCategory::Events,
        BackupCategory::Routines,
        BackupCategory::Subscriptions,
        BackupCategory::PomodoroSessions,
        BackupCategory::ValueDays,
        BackupCategory::Preferences,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Courses => "courses",
            Self::Events => "events",
            Self::Routines => "routines",
            Self::Subscriptions => "subscriptions",
            Self::PomodoroSessions => "pomodoro_sessions",
            Self::ValueDays => "value_days",
            Self::Preferences => "preferences",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.key() == key)
    }

    pub fn entry_name(self) -> String {
        format!("{}.json", self.key())
    }

    /// Every category except preferences holds a list of entities.
    pub fn is_collection(self) -> bool {
        self != Self::Preferences
    }
}

impl fmt::Display for BackupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPreferences {
    pub tasks: bool,
    pub courses: bool,
    pub events: bool,
    pub routines: bool,
    pub subscriptions: bool,
    pub pomodoro_sessions: bool,
    pub value_days: bool,
    pub preferences: bool,
}

impl Default for BackupPreferences {
    fn default() -> Self {
        Self::all(true)
    }
}

impl BackupPreferences {
    pub fn all(enabled: bool) -> Self {
        Self {
            tasks: enabled,
            courses: enabled,
            events: enabled,
            routines: enabled,
            subscriptions: enabled,
            pomodoro_sessions: enabled,
            value_days: enabled,
            preferences: enabled,
        }
    }

    pub fn only(categories: &[BackupCategory]) -> Self {
        let mut prefs = Self::all(false);
        for c in categories {
            prefs.set(*c, true);
        }
        prefs
    }

    pub fn is_enabled(&self, category: BackupCategory) -> bool {
        match category {
            BackupCategory::Tasks => self.tasks,
            BackupCategory::Courses => self.courses,
            BackupCategory::Events => self.events,
            BackupCategory::Routines => self.routines,
            BackupCategory::Subscriptions => self.subscriptions,
            BackupCategory::PomodoroSessions => self.pomodoro_sessions,
            BackupCategory::ValueDays => self.value_days,
            BackupCategory::Preferences => self.preferences,
        }
    }

    pub fn set(&mut self, category: BackupCategory, enabled: bool) {
        let slot = match category {
            BackupCategory::Tasks => &mut self.tasks,
            BackupCategory::Courses => &mut self.courses,
            BackupCategory::Events => &mut self.events,
            BackupCategory::Routines => &mut self.routines,
            BackupCategory::Subscriptions => &mut self.subscriptions,
            BackupCategory::PomodoroSessions => &mut self.pomodoro_sessions,
            BackupCategory::ValueDays => &mut self.value_days,
            BackupCategory::Preferences => &mut self.preferences,
        };
        *slot = enabled;
    }

    pub fn any_enabled(&self) -> bool {
        BackupCategory::ALL.iter().any(|c| self.is_enabled(*c))
    }

    pub fn enabled_categories(&self) -> Vec<BackupCategory> {
        BackupCategory::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

/// Basic-auth credentials for the remote store. The password is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Stored remote location. The password is write-only and not part of this view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AutoBackupPolicy {
    pub enabled: bool,
    pub last_backup_epoch_millis: Option<i64>,
}

impl AutoBackupPolicy {
    pub const MIN_INTERVAL_MILLIS: i64 = 12 * 60 * 60 * 1000;

    pub fn should_run(&self) -> bool {
        self.should_run_at(&Local::now())
    }

    /// Due once the local calendar day changed since the last backup, or 12 hours passed.
    pub fn should_run_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(last_ms) = self.last_backup_epoch_millis else {
            return true;
        };
        let Some(last) = now.timezone().timestamp_millis_opt(last_ms).single() else {
            return true;
        };
        if now.date_naive() > last.date_naive() {
            return true;
        }
        now.timestamp_millis() - last_ms >= Self::MIN_INTERVAL_MILLIS
    }
}

/// A backup archive as reported by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBackupFile {
    pub(crate) name: String,
    pub(crate) size_bytes: u64,
    pub(crate) last_modified: DateTime<Utc>,
    pub(crate) locator: String,
}

impl RemoteBackupFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }
}

/// Exported (or restored) app data keyed by category.
///
/// Equality treats an absent collection the same as an empty one, so a restored archive
/// compares equal to the payloads it was built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupArchiveContent {
    #[serde(default)]
    pub collections: BTreeMap<BackupCategory, Vec<Value>>,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
}

impl BackupArchiveContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, category: BackupCategory, items: Vec<Value>) -> Self {
        self.set_collection(category, items);
        self
    }

    pub fn with_preference(mut self, key: impl Into<String>, value: Value) -> Self {
        self.preferences.insert(key.into(), value);
        self
    }

    pub fn set_collection(&mut self, category: BackupCategory, items: Vec<Value>) {
        debug_assert!(category.is_collection());
        self.collections.insert(category, items);
    }

    pub fn collection(&self, category: BackupCategory) -> &[Value] {
        self.collections
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty() && self.collections.values().all(Vec::is_empty)
    }
}

impl PartialEq for BackupArchiveContent {
    fn eq(&self, other: &Self) -> bool {
        self.preferences == other.preferences
            && BackupCategory::ALL
                .into_iter()
                .filter(|c| c.is_collection())
                .all(|c| self.collection(c) == other.collection(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
    }

    #[test]
    fn category_keys_round_trip() {
        for c in BackupCategory::ALL {
            assert_eq!(BackupCategory::from_key(c.key()), Some(c));
            assert_eq!(c.entry_name(), format!("{}.json", c.key()));
        }
        assert_eq!(BackupCategory::from_key("unknown"), None);
        assert_eq!(
            BackupCategory::ALL.iter().filter(|c| c.is_collection()).count(),
            7
        );
    }

    #[test]
    fn preferences_default_to_everything() {
        let prefs = BackupPreferences::default();
        assert!(prefs.any_enabled());
        assert_eq!(prefs.enabled_categories().len(), 8);

        let none = BackupPreferences::all(false);
        assert!(!none.any_enabled());

        let some = BackupPreferences::only(&[BackupCategory::Events]);
        assert_eq!(some.enabled_categories(), vec![BackupCategory::Events]);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2");
        let printed = format!("{creds:?}");
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn auto_backup_disabled_never_runs() {
        let policy = AutoBackupPolicy {
            enabled: false,
            last_backup_epoch_millis: None,
        };
        assert!(!policy.should_run_at(&at(2024, 5, 1, 9, 0)));
    }

    #[test]
    fn auto_backup_runs_when_never_backed_up() {
        let policy = AutoBackupPolicy {
            enabled: true,
            last_backup_epoch_millis: None,
        };
        assert!(policy.should_run_at(&at(2024, 5, 1, 9, 0)));
    }

    #[test]
    fn auto_backup_waits_within_same_day() {
        let last = at(2024, 5, 1, 9, 0);
        let policy = AutoBackupPolicy {
            enabled: true,
            last_backup_epoch_millis: Some(last.timestamp_millis()),
        };
        assert!(!policy.should_run_at(&last));
        assert!(!policy.should_run_at(&(last + Duration::hours(11))));
        assert!(policy.should_run_at(&(last + Duration::hours(12))));
    }

    #[test]
    fn auto_backup_runs_after_midnight() {
        let last = at(2024, 5, 1, 23, 0);
        let policy = AutoBackupPolicy {
            enabled: true,
            last_backup_epoch_millis: Some(last.timestamp_millis()),
        };
        assert!(!policy.should_run_at(&(last + Duration::minutes(30))));
        assert!(policy.should_run_at(&(last + Duration::hours(1) + Duration::minutes(1))));
    }

    #[test]
    fn content_equality_treats_missing_as_empty() {
        let a = BackupArchiveContent::new()
            .with_collection(BackupCategory::Tasks, vec![serde_json::json!({"id": 1})]);
        let mut b = a.clone();
        b.set_collection(BackupCategory::Courses, Vec::new());
        assert_eq!(a, b);

        b.set_collection(BackupCategory::Courses, vec![serde_json::json!({"id": 2})]);
        assert_ne!(a, b);
    }
}
