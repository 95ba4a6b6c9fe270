use anyhow::{anyhow, Context, Result};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, OnceLock};

pub const DEFAULT_SENSITIVITY: u8 = 3;
pub const MIN_SENSITIVITY: u8 = 1;
pub const MAX_SENSITIVITY: u8 = 5;

// -------------------- Records --------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: i64,
    pub timestamp_s: u64,
    pub blocked: bool,
    pub image_ref: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewScan {
    pub timestamp_s: u64,
    pub blocked: bool,
    pub image_ref: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Undelivered,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Undelivered => "undelivered",
            NotificationStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub timestamp_s: u64,
    pub recipient: String,
    pub status: NotificationStatus,
    pub image_ref: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewNotification {
    pub timestamp_s: u64,
    pub recipient: String,
    pub status: NotificationStatus,
    pub image_ref: String,
}

// -------------------- Settings --------------------

/// Notification recipients and the detection sensitivity preference.
///
/// `sensitivity` is stored and validated but does not currently change any
/// detection threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub recipient_phone: Option<String>,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: u8,
}

fn default_true() -> bool {
    true
}

fn default_sensitivity() -> u8 {
    DEFAULT_SENSITIVITY
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recipient_email: None,
            recipient_phone: None,
            notifications_enabled: true,
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }
}

impl Settings {
    /// Email wins when both are configured.
    pub fn recipient(&self) -> Option<&str> {
        self.recipient_email
            .as_deref()
            .or(self.recipient_phone.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&self.sensitivity) {
            return Err(anyhow!(
                "sensitivity must be between {} and {}, got {}",
                MIN_SENSITIVITY,
                MAX_SENSITIVITY,
                self.sensitivity
            ));
        }
        if let Some(email) = &self.recipient_email {
            if !email_re().is_match(email) {
                return Err(anyhow!("invalid recipient email {:?}", email));
            }
        }
        if let Some(phone) = &self.recipient_phone {
            let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
            if !phone_re().is_match(phone) || !(7..=15).contains(&digits) {
                return Err(anyhow!("invalid recipient phone {:?}", phone));
            }
        }
        Ok(())
    }
}

fn email_re() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap())
}

fn phone_re() -> &'static Regex {
    static PHONE_RE: OnceLock<Regex> = OnceLock::new();
    PHONE_RE.get_or_init(|| Regex::new(r"^\+?[0-9][0-9 \-]*[0-9]$").unwrap())
}

// -------------------- Store contract --------------------

/// Persistence for scans, notifications and settings.
///
/// Each call is independent; there is no transaction spanning a scan and its
/// notification.
pub trait RecordStore: Send + Sync {
    fn append_scan(&self, scan: NewScan) -> Result<ScanRecord>;

    fn append_notification(&self, notification: NewNotification) -> Result<NotificationRecord>;

    /// Most recent scan by timestamp; ties go to the later insert.
    fn latest_scan(&self) -> Result<Option<ScanRecord>>;

    fn settings(&self) -> Result<Option<Settings>>;

    /// Validates, then replaces the stored settings.
    fn save_settings(&self, settings: Settings) -> Result<Settings>;
}

fn to_sql_ts(timestamp_s: u64) -> Result<i64> {
    i64::try_from(timestamp_s).map_err(|_| anyhow!("timestamp exceeds i64 range"))
}

fn from_sql_ts(timestamp: i64) -> Result<u64> {
    u64::try_from(timestamp).map_err(|_| anyhow!("corrupt record: negative timestamp"))
}

// -------------------- SQLite --------------------

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open record store {}", db_path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS scans (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_s INTEGER NOT NULL,
              blocked INTEGER NOT NULL,
              image_ref TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_s INTEGER NOT NULL,
              recipient TEXT NOT NULL,
              status TEXT NOT NULL,
              image_ref TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              recipient_email TEXT,
              recipient_phone TEXT,
              notifications_enabled INTEGER NOT NULL,
              sensitivity INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scans_timestamp ON scans(timestamp_s);
            "#,
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn append_scan(&self, scan: NewScan) -> Result<ScanRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scans(timestamp_s, blocked, image_ref) VALUES (?1, ?2, ?3)",
            params![to_sql_ts(scan.timestamp_s)?, scan.blocked, scan.image_ref],
        )?;
        Ok(ScanRecord {
            id: conn.last_insert_rowid(),
            timestamp_s: scan.timestamp_s,
            blocked: scan.blocked,
            image_ref: scan.image_ref,
        })
    }

    fn append_notification(&self, notification: NewNotification) -> Result<NotificationRecord> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO notifications(timestamp_s, recipient, status, image_ref)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                to_sql_ts(notification.timestamp_s)?,
                notification.recipient,
                notification.status.as_str(),
                notification.image_ref
            ],
        )?;
        Ok(NotificationRecord {
            id: conn.last_insert_rowid(),
            timestamp_s: notification.timestamp_s,
            recipient: notification.recipient,
            status: notification.status,
            image_ref: notification.image_ref,
        })
    }

    fn latest_scan(&self) -> Result<Option<ScanRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, timestamp_s, blocked, image_ref FROM scans
                ORDER BY timestamp_s DESC, id DESC LIMIT 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, timestamp, blocked, image_ref)) = row else {
            return Ok(None);
        };
        Ok(Some(ScanRecord {
            id,
            timestamp_s: from_sql_ts(timestamp)?,
            blocked,
            image_ref,
        }))
    }

    fn settings(&self) -> Result<Option<Settings>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT recipient_email, recipient_phone, notifications_enabled, sensitivity
                FROM settings WHERE id = 1
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((recipient_email, recipient_phone, notifications_enabled, sensitivity)) = row
        else {
            return Ok(None);
        };
        let sensitivity = u8::try_from(sensitivity)
            .map_err(|_| anyhow!("corrupt settings: sensitivity {}", sensitivity))?;
        Ok(Some(Settings {
            recipient_email,
            recipient_phone,
            notifications_enabled,
            sensitivity,
        }))
    }

    fn save_settings(&self, settings: Settings) -> Result<Settings> {
        settings.validate()?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO settings(id, recipient_email, recipient_phone, notifications_enabled, sensitivity)
            VALUES (1, ?1, ?2, ?3, ?4)
            "#,
            params![
                settings.recipient_email,
                settings.recipient_phone,
                settings.notifications_enabled,
                settings.sensitivity as i64
            ],
        )?;
        Ok(settings)
    }
}

// -------------------- In-memory --------------------

#[derive(Debug, Default)]
struct InMemoryRecords {
    scans: Vec<ScanRecord>,
    notifications: Vec<NotificationRecord>,
    settings: Option<Settings>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<InMemoryRecords>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, InMemoryRecords>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("record store lock poisoned"))
    }

    pub fn scans(&self) -> Result<Vec<ScanRecord>> {
        Ok(self.records()?.scans.clone())
    }

    pub fn notifications(&self) -> Result<Vec<NotificationRecord>> {
        Ok(self.records()?.notifications.clone())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn append_scan(&self, scan: NewScan) -> Result<ScanRecord> {
        let mut records = self.records()?;
        let record = ScanRecord {
            id: records.scans.len() as i64 + 1,
            timestamp_s: scan.timestamp_s,
            blocked: scan.blocked,
            image_ref: scan.image_ref,
        };
        records.scans.push(record.clone());
        Ok(record)
    }

    fn append_notification(&self, notification: NewNotification) -> Result<NotificationRecord> {
        let mut records = self.records()?;
        let record = NotificationRecord {
            id: records.notifications.len() as i64 + 1,
            timestamp_s: notification.timestamp_s,
            recipient: notification.recipient,
            status: notification.status,
            image_ref: notification.image_ref,
        };
        records.notifications.push(record.clone());
        Ok(record)
    }

    fn latest_scan(&self) -> Result<Option<ScanRecord>> {
        let records = self.records()?;
        Ok(records
            .scans
            .iter()
            .max_by_key(|scan| (scan.timestamp_s, scan.id))
            .cloned())
    }

    fn settings(&self) -> Result<Option<Settings>> {
        Ok(self.records()?.settings.clone())
    }

    fn save_settings(&self, settings: Settings) -> Result<Settings> {
        settings.validate()?;
        self.records()?.settings = Some(settings.clone());
        Ok(settings)
    }
}
