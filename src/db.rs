use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    engine::{Snapshot, SnapshotProvider},
    error::DbError,
    materialize::{MatchPair, MatchSink},
    model::{ClassRange, Offer, OfferId, RawOffer, RawRequest, Request, RequestId, UserId},
    schedule::Availability,
};

type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub name: String,
    pub class_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub admin: bool,
    /// Set for imported accounts until they fill in their personal data.
    pub first_login: bool,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub name: &'a str,
    pub class_name: Option<&'a str>,
    pub password_hash: &'a str,
    /// Kept in clear text until the user picks an own password.
    pub start_password: Option<&'a str>,
    pub admin: bool,
}

/// Changes to a user's personal data. `None` leaves a field alone, an empty
/// email or phone removes it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Whether the matched partner may see the owner's email and phone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactConsent {
    #[serde(default)]
    pub allow_email: bool,
    #[serde(default)]
    pub allow_phone: bool,
}

/// The other side of a match. Email and phone are only present when the
/// partner allowed them on their offer or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partner {
    pub name: String,
    pub class_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub code: String,
    pub name: String,
}

/// An offer as shown to its owner, with the matched student if any.
#[derive(Debug, Clone, Serialize)]
pub struct OfferListing {
    pub id: OfferId,
    pub subject: String,
    pub availability: Availability,
    pub min_class: u8,
    pub max_class: u8,
    #[serde(flatten)]
    pub consent: ContactConsent,
    pub partner: Option<Partner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestListing {
    pub id: RequestId,
    pub subject: String,
    pub availability: Availability,
    #[serde(flatten)]
    pub consent: ContactConsent,
    pub partner: Option<Partner>,
}

/// One line per request, matched or not.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOverview {
    pub request_id: RequestId,
    pub subject: String,
    pub student: String,
    pub student_class: Option<String>,
    pub offer_id: Option<OfferId>,
    pub tutor: Option<String>,
    pub tutor_class: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchRun {
    pub id: i64,
    pub ran_at: String,
    pub matched: i64,
    pub total_requests: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartPassword {
    pub username: String,
    pub password: String,
}

const CREATE_TABLE_USERS: &str = "CREATE TABLE IF NOT EXISTS users (
    id integer primary key,
    username text not null unique,
    name text not null,
    class_name text,
    email text,
    phone text,
    password_hash text not null,
    start_password text,
    admin boolean not null default FALSE,
    first_login boolean not null default FALSE
)";

const CREATE_TABLE_SESSIONS: &str = "CREATE TABLE IF NOT EXISTS sessions (
    token text primary key,
    user_id integer not null,
    expires_at integer not null,
    foreign key(user_id) references users(id) on delete cascade
)";

const CREATE_TABLE_SUBJECTS: &str = "CREATE TABLE IF NOT EXISTS subjects (
    code text primary key,
    name text not null
)";

const CREATE_TABLE_OFFERS: &str = "CREATE TABLE IF NOT EXISTS offers (
    id integer primary key,
    user_id integer not null,
    subject text not null,
    availability text not null,
    min_class integer not null,
    max_class integer not null,
    allow_email boolean not null default FALSE,
    allow_phone boolean not null default FALSE,
    foreign key(user_id) references users(id) on delete cascade,
    foreign key(subject) references subjects(code) on delete cascade
)";

const CREATE_TABLE_REQUESTS: &str = "CREATE TABLE IF NOT EXISTS requests (
    id integer primary key,
    user_id integer not null,
    subject text not null,
    availability text not null,
    allow_email boolean not null default FALSE,
    allow_phone boolean not null default FALSE,
    foreign key(user_id) references users(id) on delete cascade,
    foreign key(subject) references subjects(code) on delete cascade
)";

const CREATE_TABLE_MATCHES: &str = "CREATE TABLE IF NOT EXISTS matches (
    offer_id integer not null unique,
    request_id integer not null unique,
    foreign key(offer_id) references offers(id) on delete cascade,
    foreign key(request_id) references requests(id) on delete cascade
)";

const CREATE_TABLE_MATCH_RUNS: &str = "CREATE TABLE IF NOT EXISTS match_runs (
    id integer primary key,
    ran_at text not null,
    matched integer not null,
    total_requests integer not null
)";

const USER_COLUMNS: &str =
    "u.id, u.username, u.name, u.class_name, u.email, u.phone, u.admin, u.first_login";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        name: row.get(2)?,
        class_name: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        admin: row.get(6)?,
        first_login: row.get(7)?,
    })
}

/// Reads the partner columns starting at `first`: name, class, email, phone.
fn partner_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Option<Partner>> {
    let Some(name) = row.get::<_, Option<String>>(first)? else {
        return Ok(None);
    };
    Ok(Some(Partner {
        name,
        class_name: row.get(first + 1)?,
        email: row.get(first + 2)?,
        phone: row.get(first + 3)?,
    }))
}

fn parse_availability(json: &str) -> Result<Availability> {
    Ok(serde_json::from_str(json)?)
}

#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Database> {
        info!(path, "opening database");
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Database> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Database> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let s = Database {
            connection: Arc::new(Mutex::new(conn)),
        };
        s.migrate()?;
        Ok(s)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        let creations = [
            CREATE_TABLE_USERS,
            CREATE_TABLE_SESSIONS,
            CREATE_TABLE_SUBJECTS,
            CREATE_TABLE_OFFERS,
            CREATE_TABLE_REQUESTS,
            CREATE_TABLE_MATCHES,
            CREATE_TABLE_MATCH_RUNS,
        ];
        for creation in creations {
            conn.execute(creation, [])?;
        }
        Ok(())
    }

    pub fn add_user(&self, user: &NewUser<'_>) -> Result<UserId> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users
                 (username, name, class_name, password_hash, start_password, admin, first_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.username,
                user.name,
                user.class_name,
                user.password_hash,
                user.start_password,
                user.admin,
                user.start_password.is_some()
            ],
        )?;
        Ok(UserId(conn.last_insert_rowid()))
    }

    pub fn user_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT count(*) FROM users", [], |row| row.get(0))?)
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1",
                [username],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    pub fn credentials(&self, username: &str) -> Result<Option<Credentials>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS}, u.password_hash FROM users u WHERE u.username = ?1"
                ),
                [username],
                |row| {
                    Ok(Credentials {
                        user: user_from_row(row)?,
                        password_hash: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1"),
                [id.0],
                user_from_row,
            )
            .optional()?)
    }

    pub fn password_hash(&self, user: UserId) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                [user.0],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Stores the new hash, forgets the start password and ends every session.
    pub fn update_password(&self, user: UserId, password_hash: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE users SET password_hash = ?1, start_password = NULL WHERE id = ?2",
            params![password_hash, user.0],
        )?;
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", [user.0])?;
        tx.commit()?;
        Ok(())
    }

    /// Applies `update` and clears the first-login flag.
    pub fn update_profile(&self, user: UserId, update: &ProfileUpdate) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET
                 name = coalesce(?1, name),
                 email = CASE WHEN ?2 IS NULL THEN email ELSE nullif(?2, '') END,
                 phone = CASE WHEN ?3 IS NULL THEN phone ELSE nullif(?3, '') END,
                 first_login = FALSE
             WHERE id = ?4",
            params![update.name, update.email, update.phone, user.0],
        )?;
        Ok(())
    }

    /// Start passwords that are still unused, by class and then username.
    /// Users without a class are listed under an empty class name.
    pub fn start_passwords(&self) -> Result<BTreeMap<String, Vec<StartPassword>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT coalesce(class_name, ''), username, start_password FROM users
             WHERE start_password IS NOT NULL
             ORDER BY class_name, username",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                StartPassword {
                    username: row.get(1)?,
                    password: row.get(2)?,
                },
            ))
        })?;

        let mut classes: BTreeMap<String, Vec<StartPassword>> = BTreeMap::new();
        for row in rows {
            let (class_name, entry) = row?;
            classes.entry(class_name).or_default().push(entry);
        }
        Ok(classes)
    }

    /// Returns false when no user has `username`.
    pub fn set_admin(&self, username: &str, admin: bool) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE users SET admin = ?1 WHERE username = ?2",
            params![admin, username],
        )?;
        Ok(changed > 0)
    }

    pub fn create_session(
        &self,
        token: &str,
        user: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![token, user.0, expires_at.timestamp()],
        )?;
        Ok(())
    }

    /// The user owning `token`, unless the session is unknown or expired.
    pub fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS}
                     FROM sessions s JOIN users u ON s.user_id = u.id
                     WHERE s.token = ?1 AND s.expires_at > ?2"
                ),
                params![token, now.timestamp()],
                user_from_row,
            )
            .optional()?)
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM sessions WHERE token = ?1", [token])?;
        Ok(())
    }

    pub fn upsert_subject(&self, code: &str, name: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO subjects (code, name) VALUES (?1, ?2)
             ON CONFLICT (code) DO UPDATE SET name = excluded.name",
            [code, name],
        )?;
        Ok(())
    }

    pub fn subjects(&self) -> Result<Vec<Subject>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT code, name FROM subjects ORDER BY code")?;
        let subjects = stmt
            .query_map([], |row| {
                Ok(Subject {
                    code: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subjects)
    }

    pub fn subject_exists(&self, code: &str) -> Result<bool> {
        Ok(self
            .conn()
            .query_row("SELECT 1 FROM subjects WHERE code = ?1", [code], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn add_offer(
        &self,
        owner: UserId,
        subject: &str,
        availability: &Availability,
        classes: ClassRange,
        consent: ContactConsent,
    ) -> Result<OfferId> {
        let availability = serde_json::to_string(availability)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO offers
                 (user_id, subject, availability, min_class, max_class, allow_email, allow_phone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                owner.0,
                subject,
                availability,
                classes.min,
                classes.max,
                consent.allow_email,
                consent.allow_phone
            ],
        )?;
        Ok(OfferId(conn.last_insert_rowid()))
    }

    /// The owner's offers; the partner is the student of the matched request.
    pub fn offers_of(&self, owner: UserId) -> Result<Vec<OfferListing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT o.id, o.subject, o.availability, o.min_class, o.max_class,
                    o.allow_email, o.allow_phone, u.name, u.class_name,
                    CASE WHEN r.allow_email THEN u.email END,
                    CASE WHEN r.allow_phone THEN u.phone END
             FROM offers o
             LEFT JOIN matches m ON m.offer_id = o.id
             LEFT JOIN requests r ON r.id = m.request_id
             LEFT JOIN users u ON u.id = r.user_id
             WHERE o.user_id = ?1
             ORDER BY o.id",
        )?;
        let rows = stmt.query_map([owner.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                ClassRange {
                    min: row.get(3)?,
                    max: row.get(4)?,
                },
                ContactConsent {
                    allow_email: row.get(5)?,
                    allow_phone: row.get(6)?,
                },
                partner_from_row(row, 7)?,
            ))
        })?;

        let mut offers = Vec::new();
        for row in rows {
            let (id, subject, availability, classes, consent, partner) = row?;
            offers.push(OfferListing {
                id: OfferId(id),
                subject,
                availability: parse_availability(&availability)?,
                min_class: classes.min,
                max_class: classes.max,
                consent,
                partner,
            });
        }
        Ok(offers)
    }

    /// Deletes `offer` if `owner` owns it. Returns whether a row went away.
    pub fn delete_offer(&self, owner: UserId, offer: OfferId) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM offers WHERE id = ?1 AND user_id = ?2",
            params![offer.0, owner.0],
        )?;
        Ok(deleted > 0)
    }

    pub fn add_request(
        &self,
        owner: UserId,
        subject: &str,
        availability: &Availability,
        consent: ContactConsent,
    ) -> Result<RequestId> {
        let availability = serde_json::to_string(availability)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO requests (user_id, subject, availability, allow_email, allow_phone)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                owner.0,
                subject,
                availability,
                consent.allow_email,
                consent.allow_phone
            ],
        )?;
        Ok(RequestId(conn.last_insert_rowid()))
    }

    pub fn requests_of(&self, owner: UserId) -> Result<Vec<RequestListing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.subject, r.availability, r.allow_email, r.allow_phone,
                    u.name, u.class_name,
                    CASE WHEN o.allow_email THEN u.email END,
                    CASE WHEN o.allow_phone THEN u.phone END
             FROM requests r
             LEFT JOIN matches m ON m.request_id = r.id
             LEFT JOIN offers o ON o.id = m.offer_id
             LEFT JOIN users u ON u.id = o.user_id
             WHERE r.user_id = ?1
             ORDER BY r.id",
        )?;
        let rows = stmt.query_map([owner.0], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                ContactConsent {
                    allow_email: row.get(3)?,
                    allow_phone: row.get(4)?,
                },
                partner_from_row(row, 5)?,
            ))
        })?;

        let mut requests = Vec::new();
        for row in rows {
            let (id, subject, availability, consent, partner) = row?;
            requests.push(RequestListing {
                id: RequestId(id),
                subject,
                availability: parse_availability(&availability)?,
                consent,
                partner,
            });
        }
        Ok(requests)
    }

    pub fn delete_request(&self, owner: UserId, request: RequestId) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM requests WHERE id = ?1 AND user_id = ?2",
            params![request.0, owner.0],
        )?;
        Ok(deleted > 0)
    }

    /// Removes every offer, request and match, e.g. at the start of a school term.
    pub fn clear_offers(&self) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM matches", [])?;
        tx.execute("DELETE FROM offers", [])?;
        tx.execute("DELETE FROM requests", [])?;
        tx.commit()?;
        info!("cleared all offers, requests and matches");
        Ok(())
    }

    pub fn match_overview(&self) -> Result<Vec<MatchOverview>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.subject, s.name, s.class_name, o.id, t.name, t.class_name
             FROM requests r
             JOIN users s ON s.id = r.user_id
             LEFT JOIN matches m ON m.request_id = r.id
             LEFT JOIN offers o ON o.id = m.offer_id
             LEFT JOIN users t ON t.id = o.user_id
             ORDER BY r.id",
        )?;
        let overview = stmt
            .query_map([], |row| {
                Ok(MatchOverview {
                    request_id: RequestId(row.get(0)?),
                    subject: row.get(1)?,
                    student: row.get(2)?,
                    student_class: row.get(3)?,
                    offer_id: row.get::<_, Option<i64>>(4)?.map(OfferId),
                    tutor: row.get(5)?,
                    tutor_class: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(overview)
    }

    pub fn latest_run(&self) -> Result<Option<MatchRun>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, ran_at, matched, total_requests FROM match_runs
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(MatchRun {
                        id: row.get(0)?,
                        ran_at: row.get(1)?,
                        matched: row.get(2)?,
                        total_requests: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }
}

impl SnapshotProvider for Database {
    type Error = DbError;

    /// Reads all offers and requests inside one transaction, ascending by id.
    fn snapshot(&self) -> Result<Snapshot> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut offers = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, subject, availability, min_class, max_class
                 FROM offers ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let availability: Option<String> = row.get(3)?;
                offers.push(Offer::try_from(RawOffer {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    subject: row.get(2)?,
                    availability: availability.as_deref().map(parse_availability).transpose()?,
                    min_class: row.get(4)?,
                    max_class: row.get(5)?,
                })?);
            }
        }

        let mut requests = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, user_id, subject, availability FROM requests ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let availability: Option<String> = row.get(3)?;
                requests.push(Request::try_from(RawRequest {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    subject: row.get(2)?,
                    availability: availability.as_deref().map(parse_availability).transpose()?,
                })?);
            }
        }

        tx.commit()?;
        debug!(
            offers = offers.len(),
            requests = requests.len(),
            "took snapshot"
        );
        Ok(Snapshot { offers, requests })
    }
}

impl MatchSink for Database {
    type Error = DbError;

    /// Deletes the previous match set and inserts `pairs` in one transaction.
    fn replace_matches(&self, pairs: &[MatchPair]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM matches", [])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO matches (offer_id, request_id) VALUES (?1, ?2)")?;
            for pair in pairs {
                insert.execute(params![pair.offer_id.0, pair.request_id.0])?;
            }
        }
        let total_requests: i64 =
            tx.query_row("SELECT count(*) FROM requests", [], |row| row.get(0))?;
        tx.execute(
            "INSERT INTO match_runs (ran_at, matched, total_requests) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), pairs.len() as i64, total_requests],
        )?;
        tx.commit()?;
        Ok(())
    }
}
