use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use prospector_contracts::{
    Campaign, CampaignParameters, CampaignStatus, CampaignUpdate, ConversationTurn, Role,
};
use prospector_kernel::{progress_for_status, ConversationKey};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
    #[error("conversation {0} already produced a campaign")]
    AlreadyMaterialized(String),
}

/// Append-only history of chat turns, partitioned by conversation key.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Records one user message and the reply to it. Both turns are stored or
    /// neither is.
    async fn append_exchange(
        &self,
        key: &ConversationKey,
        message: &str,
        reply: &str,
    ) -> Result<(ConversationTurn, ConversationTurn), StoreError>;

    /// Turns for the key, oldest first.
    async fn history(&self, key: &ConversationKey) -> Result<Vec<ConversationTurn>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub user_id: String,
    pub name: String,
    pub parameters: CampaignParameters,
    pub origin: ConversationKey,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Single-row insert. Fails with `AlreadyMaterialized` when the origin
    /// conversation already has a campaign.
    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, StoreError>;

    async fn campaign_for_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Campaign>, StoreError>;

    async fn campaigns_for_user(&self, user_id: &str) -> Result<Vec<Campaign>, StoreError>;

    async fn campaign(&self, user_id: &str, id: &str) -> Result<Option<Campaign>, StoreError>;

    async fn apply_update(&self, update: &CampaignUpdate) -> Result<Option<Campaign>, StoreError>;
}

pub struct SqliteStore {
    inner: Mutex<SqliteInner>,
}

struct SqliteInner {
    conn: Connection,
    last_ts: Option<DateTime<Utc>>,
}

const CAMPAIGN_COLUMNS: &str =
    "id, user_id, name, parameters_json, status, progress, lead_count, created_at, updated_at";

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversation_turns (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                draft_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS conversation_turns_key
                ON conversation_turns (user_id, draft_id, seq);
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parameters_json TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL,
                lead_count INTEGER NOT NULL,
                origin_conversation TEXT UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS campaigns_user ON campaigns (user_id, created_at);
            ",
        )?;
        let last_ts: Option<String> = conn
            .query_row("SELECT MAX(created_at) FROM conversation_turns", [], |row| {
                row.get(0)
            })?;
        Ok(Self {
            inner: Mutex::new(SqliteInner {
                conn,
                last_ts: last_ts.and_then(|v| parse_ts(&v)),
            }),
        })
    }
}

impl SqliteInner {
    /// Wall-clock time, never earlier than the previous turn's timestamp.
    fn next_turn_ts(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_ts {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_ts = Some(ts);
        ts
    }

    fn new_turn(&mut self, key: &ConversationKey, role: Role, content: &str) -> ConversationTurn {
        ConversationTurn {
            id: format!("turn_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: key.user_id.clone(),
            campaign_draft_id: key.draft_id.clone(),
            role,
            content: content.to_string(),
            created_at: format_ts(self.next_turn_ts()),
        }
    }

    fn campaign_by_id(&self, user_id: &str, id: &str) -> Result<Option<Campaign>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
                CampaignRow::read,
            )
            .optional()?;
        row.map(CampaignRow::into_campaign).transpose()
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append_exchange(
        &self,
        key: &ConversationKey,
        message: &str,
        reply: &str,
    ) -> Result<(ConversationTurn, ConversationTurn), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner.new_turn(key, Role::User, message);
        let assistant = inner.new_turn(key, Role::Assistant, reply);

        let tx = inner.conn.transaction()?;
        for turn in [&user, &assistant] {
            tx.execute(
                "
                INSERT INTO conversation_turns (id, user_id, draft_id, role, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    turn.id,
                    turn.user_id,
                    turn.campaign_draft_id,
                    turn.role.as_str(),
                    turn.content,
                    turn.created_at
                ],
            )?;
        }
        tx.commit()?;
        Ok((user, assistant))
    }

    async fn history(&self, key: &ConversationKey) -> Result<Vec<ConversationTurn>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(
            "
            SELECT id, user_id, draft_id, role, content, created_at
            FROM conversation_turns
            WHERE user_id = ?1 AND draft_id IS ?2
            ORDER BY seq
            ",
        )?;
        let rows = stmt.query_map(params![key.user_id, key.draft_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (id, user_id, campaign_draft_id, role, content, created_at) = row?;
            let role = Role::parse(&role)
                .ok_or_else(|| StoreError::Corrupt(format!("turn {id} has role {role:?}")))?;
            turns.push(ConversationTurn {
                id,
                user_id,
                campaign_draft_id,
                role,
                content,
                created_at,
            });
        }
        Ok(turns)
    }
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, StoreError> {
        let inner = self.inner.lock().await;
        let now = format_ts(Utc::now());
        let created = Campaign {
            id: format!("cmp_{}", uuid::Uuid::new_v4().as_simple()),
            user_id: campaign.user_id,
            name: campaign.name,
            parameters: campaign.parameters,
            status: CampaignStatus::Created,
            progress: progress_for_status(CampaignStatus::Created),
            lead_count: 0,
            created_at: now.clone(),
            updated_at: now,
        };
        let parameters_json = serde_json::to_string(&created.parameters)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let origin = campaign.origin.storage_key();
        let inserted = inner.conn.execute(
            "
            INSERT INTO campaigns
            (id, user_id, name, parameters_json, status, progress, lead_count,
             origin_conversation, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                created.id,
                created.user_id,
                created.name,
                parameters_json,
                created.status.as_str(),
                created.progress as i64,
                created.lead_count,
                origin,
                created.created_at,
                created.updated_at
            ],
        );
        match inserted {
            Ok(_) => Ok(created),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyMaterialized(origin))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn campaign_for_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        let row = inner
            .conn
            .query_row(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE origin_conversation = ?1"),
                params![key.storage_key()],
                CampaignRow::read,
            )
            .optional()?;
        row.map(CampaignRow::into_campaign).transpose()
    }

    async fn campaigns_for_user(&self, user_id: &str) -> Result<Vec<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], CampaignRow::read)?;
        let mut campaigns = Vec::new();
        for row in rows {
            campaigns.push(row?.into_campaign()?);
        }
        Ok(campaigns)
    }

    async fn campaign(&self, user_id: &str, id: &str) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        inner.campaign_by_id(user_id, id)
    }

    async fn apply_update(&self, update: &CampaignUpdate) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(mut campaign) = inner.campaign_by_id(&update.user_id, &update.campaign_id)? else {
            return Ok(None);
        };
        if let Some(status) = update.status {
            campaign.status = status;
            campaign.progress = progress_for_status(status);
        }
        if let Some(lead_count) = update.lead_count {
            campaign.lead_count = lead_count;
        }
        campaign.updated_at = format_ts(Utc::now());
        inner.conn.execute(
            "
            UPDATE campaigns
            SET status = ?1, progress = ?2, lead_count = ?3, updated_at = ?4
            WHERE id = ?5 AND user_id = ?6
            ",
            params![
                campaign.status.as_str(),
                campaign.progress as i64,
                campaign.lead_count,
                campaign.updated_at,
                campaign.id,
                campaign.user_id
            ],
        )?;
        Ok(Some(campaign))
    }
}

struct CampaignRow {
    id: String,
    user_id: String,
    name: String,
    parameters_json: String,
    status: String,
    progress: i64,
    lead_count: i64,
    created_at: String,
    updated_at: String,
}

impl CampaignRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            parameters_json: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            lead_count: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_campaign(self) -> Result<Campaign, StoreError> {
        let parameters: CampaignParameters = serde_json::from_str(&self.parameters_json)
            .map_err(|e| StoreError::Corrupt(format!("campaign {} parameters: {e}", self.id)))?;
        let status = CampaignStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("campaign {} has status {:?}", self.id, self.status))
        })?;
        let progress = u8::try_from(self.progress)
            .map_err(|_| StoreError::Corrupt(format!("campaign {} progress", self.id)))?;
        Ok(Campaign {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            parameters,
            status,
            progress,
            lead_count: self.lead_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

#[cfg(test)]
impl SqliteStore {
    /// Makes every assistant-turn insert fail inside SQLite.
    pub(crate) async fn refuse_assistant_turns(&self) {
        let inner = self.inner.lock().await;
        inner
            .conn
            .execute_batch(
                "
                CREATE TRIGGER refuse_assistant BEFORE INSERT ON conversation_turns
                WHEN NEW.role = 'assistant'
                BEGIN SELECT RAISE(ABORT, 'assistant write refused'); END;
                ",
            )
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_for(location: &str) -> CampaignParameters {
        CampaignParameters {
            locations: [location.to_string()].into(),
            business_types: ["saas".to_string()].into(),
            job_titles: ["ceo".to_string()].into(),
        }
    }

    #[tokio::test]
    async fn history_is_partitioned_by_draft_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let global = ConversationKey::new("user-a", None);
        let draft = ConversationKey::new("user-a", Some("draft-1"));
        let other_user = ConversationKey::new("user-b", None);

        store.append_exchange(&global, "hello", "hi").await.unwrap();
        store
            .append_exchange(&draft, "draft hello", "draft hi")
            .await
            .unwrap();
        store
            .append_exchange(&other_user, "other", "other hi")
            .await
            .unwrap();

        let turns = store.history(&global).await.unwrap();
        assert_eq!(
            turns.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(),
            vec!["hello", "hi"]
        );
        assert!(turns.iter().all(|t| t.campaign_draft_id.is_none()));
        assert!(turns.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let drafted = store.history(&draft).await.unwrap();
        assert_eq!(drafted.len(), 2);
        assert_eq!(drafted[0].campaign_draft_id.as_deref(), Some("draft-1"));

        // history can be re-read and is not consumed
        assert_eq!(store.history(&global).await.unwrap(), turns);
    }

    #[tokio::test]
    async fn second_campaign_for_same_conversation_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = ConversationKey::new("user-a", None);
        let first = store
            .insert_campaign(NewCampaign {
                user_id: "user-a".to_string(),
                name: "First".to_string(),
                parameters: params_for("sydney"),
                origin: key.clone(),
            })
            .await
            .unwrap();
        assert_eq!(first.status, CampaignStatus::Created);
        assert_eq!(first.progress, 0);
        assert_eq!(first.lead_count, 0);

        let err = store
            .insert_campaign(NewCampaign {
                user_id: "user-a".to_string(),
                name: "Second".to_string(),
                parameters: params_for("perth"),
                origin: key.clone(),
            })
            .await
            .expect_err("duplicate origin must fail");
        assert!(matches!(err, StoreError::AlreadyMaterialized(_)));

        let marker = store.campaign_for_conversation(&key).await.unwrap();
        assert_eq!(marker, Some(first));
        assert_eq!(store.campaigns_for_user("user-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_advances_progress_for_owner_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = store
            .insert_campaign(NewCampaign {
                user_id: "user-a".to_string(),
                name: "Tech".to_string(),
                parameters: params_for("sydney"),
                origin: ConversationKey::new("user-a", Some("d")),
            })
            .await
            .unwrap();

        let foreign = store
            .apply_update(&CampaignUpdate {
                user_id: "user-b".to_string(),
                campaign_id: created.id.clone(),
                status: Some(CampaignStatus::Complete),
                lead_count: None,
            })
            .await
            .unwrap();
        assert!(foreign.is_none());

        let updated = store
            .apply_update(&CampaignUpdate {
                user_id: "user-a".to_string(),
                campaign_id: created.id.clone(),
                status: Some(CampaignStatus::Researched),
                lead_count: Some(42),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.progress, 75);
        assert_eq!(updated.lead_count, 42);
        assert_eq!(
            store.campaign("user-a", &created.id).await.unwrap(),
            Some(updated)
        );
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("prospector-store-{nanos}.db"));
        let path = path.to_string_lossy().to_string();
        let key = ConversationKey::new("user-a", None);

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .append_exchange(&key, "persisted", "stored")
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let turns = reopened.history(&key).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "persisted");
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn failed_reply_write_rolls_back_the_message() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = ConversationKey::new("user-a", None);
        store.refuse_assistant_turns().await;

        let err = store
            .append_exchange(&key, "tech startups", "Which roles?")
            .await
            .expect_err("assistant insert refused");
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(store.history(&key).await.unwrap().is_empty());
    }
}
