use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prospector_contracts::{Campaign, CampaignParameters, ChatResponse, ConversationTurn, ErrorBody};
use prospector_kernel::{already_created_reply, missing_categories, ConversationKey};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::engine::{EngineError, ExtractionEngine};
use crate::store::{CampaignStore, ConversationStore, NewCampaign, StoreError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("campaign parameters are incomplete; missing {0}")]
    Incomplete(String),
    #[error("campaign insert failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub turn_timeout: Duration,
    pub max_message_chars: usize,
}

/// Persists a campaign for a completed draft. Each call inserts exactly one
/// row; deciding whether a conversation may materialize is left to the caller.
pub async fn materialize(
    store: &dyn CampaignStore,
    origin: &ConversationKey,
    name: &str,
    parameters: CampaignParameters,
) -> Result<Campaign, MaterializeError> {
    let missing = missing_categories(&parameters);
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|c| c.as_str()).collect();
        return Err(MaterializeError::Incomplete(names.join(", ")));
    }
    let campaign = store
        .insert_campaign(NewCampaign {
            user_id: origin.user_id.clone(),
            name: name.to_string(),
            parameters,
            origin: origin.clone(),
        })
        .await?;
    Ok(campaign)
}

/// Runs chat turns. Turns for the same conversation key are serialized; turns
/// for different keys run independently.
pub struct ChatService {
    turns: Arc<dyn ConversationStore>,
    campaigns: Arc<dyn CampaignStore>,
    engine: ExtractionEngine,
    settings: ChatSettings,
    locks: Mutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
}

impl ChatService {
    pub fn new(
        turns: Arc<dyn ConversationStore>,
        campaigns: Arc<dyn CampaignStore>,
        engine: ExtractionEngine,
        settings: ChatSettings,
    ) -> Self {
        Self {
            turns,
            campaigns,
            engine,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn submit_message(
        &self,
        user_id: &str,
        draft_id: Option<&str>,
        text: &str,
    ) -> Result<ChatResponse, ChatError> {
        let key = conversation_key(user_id, draft_id)?;
        let message = text.trim();
        if message.is_empty() {
            return Err(ChatError::InvalidInput("message is required".to_string()));
        }
        if message.chars().count() > self.settings.max_message_chars {
            return Err(ChatError::InvalidInput(format!(
                "message exceeds {} characters",
                self.settings.max_message_chars
            )));
        }

        let lock = self.conversation_lock(&key).await;
        let outcome = {
            let _turn = lock.lock().await;
            self.run_turn(&key, message).await
        };
        drop(lock);
        self.prune_locks().await;
        outcome
    }

    pub async fn history(
        &self,
        user_id: &str,
        draft_id: Option<&str>,
    ) -> Result<Vec<ConversationTurn>, ChatError> {
        let key = conversation_key(user_id, draft_id)?;
        Ok(self.turns.history(&key).await?)
    }

    async fn run_turn(
        &self,
        key: &ConversationKey,
        message: &str,
    ) -> Result<ChatResponse, ChatError> {
        let history = self.turns.history(key).await?;
        let existing = self.campaigns.campaign_for_conversation(key).await?;

        let result = match timeout(
            self.settings.turn_timeout,
            self.engine.extract(&history, message),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(user_id = %key.user_id, draft_id = ?key.draft_id, error = %e, "extraction failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(user_id = %key.user_id, draft_id = ?key.draft_id, "extraction timed out");
                return Err(EngineError::Timeout(self.settings.turn_timeout).into());
            }
        };

        let mut reply = result.reply;
        let mut creation = match (
            result.should_create_campaign,
            result.campaign_name,
            result.campaign_parameters,
        ) {
            (true, Some(name), Some(parameters)) => Some((name, parameters)),
            _ => None,
        };
        if let (Some(_), Some(campaign)) = (&creation, &existing) {
            info!(
                user_id = %key.user_id,
                campaign_id = %campaign.id,
                "conversation already materialized; not creating another campaign"
            );
            reply = already_created_reply(&campaign.name);
            creation = None;
        }

        self.turns.append_exchange(key, message, &reply).await?;

        let Some((name, parameters)) = creation else {
            info!(user_id = %key.user_id, draft_id = ?key.draft_id, turns = history.len() + 2, "turn collected");
            return Ok(ChatResponse {
                reply,
                should_create_campaign: false,
                campaign: None,
                materialization_error: None,
            });
        };

        match materialize(self.campaigns.as_ref(), key, &name, parameters).await {
            Ok(campaign) => {
                info!(user_id = %key.user_id, campaign_id = %campaign.id, "campaign materialized");
                Ok(ChatResponse {
                    reply,
                    should_create_campaign: true,
                    campaign: Some(campaign),
                    materialization_error: None,
                })
            }
            Err(e) => {
                error!(user_id = %key.user_id, draft_id = ?key.draft_id, error = %e, "campaign materialization failed");
                Ok(ChatResponse {
                    reply,
                    should_create_campaign: false,
                    campaign: None,
                    materialization_error: Some(ErrorBody {
                        code: "materialization.failed".to_string(),
                        message: e.to_string(),
                        details: None,
                    }),
                })
            }
        }
    }

    async fn conversation_lock(&self, key: &ConversationKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

fn conversation_key(user_id: &str, draft_id: Option<&str>) -> Result<ConversationKey, ChatError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ChatError::InvalidInput("user id is required".to_string()));
    }
    let draft_id = draft_id.map(str::trim).filter(|v| !v.is_empty());
    Ok(ConversationKey::new(user_id, draft_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GenerationRequest, TextGenerator};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use prospector_contracts::{CampaignStatus, CampaignUpdate, Role};
    use std::collections::VecDeque;

    struct Scripted {
        replies: std::sync::Mutex<VecDeque<Result<String, EngineError>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, EngineError> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Transport("script exhausted".to_string())))
        }
    }

    /// Reports how many prior turns each request carried.
    struct HistoryCounter;

    #[async_trait]
    impl TextGenerator for HistoryCounter {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, EngineError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(format!(
                r#"{{"reply":"Lead Generation Joe saw {} turns","shouldCreateCampaign":false}}"#,
                request.history.len()
            ))
        }
    }

    struct BrokenCampaigns;

    #[async_trait]
    impl CampaignStore for BrokenCampaigns {
        async fn insert_campaign(&self, _campaign: NewCampaign) -> Result<Campaign, StoreError> {
            Err(StoreError::Corrupt("disk full".to_string()))
        }

        async fn campaign_for_conversation(
            &self,
            _key: &ConversationKey,
        ) -> Result<Option<Campaign>, StoreError> {
            Ok(None)
        }

        async fn campaigns_for_user(&self, _user_id: &str) -> Result<Vec<Campaign>, StoreError> {
            Ok(Vec::new())
        }

        async fn campaign(&self, _user_id: &str, _id: &str) -> Result<Option<Campaign>, StoreError> {
            Ok(None)
        }

        async fn apply_update(
            &self,
            _update: &CampaignUpdate,
        ) -> Result<Option<Campaign>, StoreError> {
            Ok(None)
        }
    }

    fn settings() -> ChatSettings {
        ChatSettings {
            turn_timeout: Duration::from_secs(5),
            max_message_chars: 200,
        }
    }

    fn service(generator: Arc<dyn TextGenerator>) -> (ChatService, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = ExtractionEngine::new(generator).unwrap();
        (
            ChatService::new(store.clone(), store.clone(), engine, settings()),
            store,
        )
    }

    fn collecting(reply: &str) -> Result<String, EngineError> {
        Ok(serde_json::json!({"reply": reply, "shouldCreateCampaign": false}).to_string())
    }

    fn completing() -> Result<String, EngineError> {
        Ok(serde_json::json!({
            "reply": "Perfect! I'll create your campaign now.",
            "shouldCreateCampaign": true,
            "campaignParameters": {
                "locations": ["Sydney Australia", "Melbourne Australia"],
                "businessTypes": ["Tech Startup"],
                "jobTitles": ["CEO", "founder"]
            },
            "campaignName": "Tech Startup Leaders - Australia"
        })
        .to_string())
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_persisting() {
        let (chat, _) = service(Scripted::new(vec![]));
        let err = chat
            .submit_message("user-a", None, "   ")
            .await
            .expect_err("blank message");
        assert!(matches!(err, ChatError::InvalidInput(_)));
        let err = chat
            .submit_message("user-a", None, &"x".repeat(201))
            .await
            .expect_err("oversized message");
        assert!(matches!(err, ChatError::InvalidInput(_)));
        assert!(chat.history("user-a", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_persists_nothing() {
        let (chat, _) = service(Scripted::new(vec![Err(EngineError::Http {
            status: 429,
            body: "quota".to_string(),
        })]));
        let err = chat
            .submit_message("user-a", None, "tech startups")
            .await
            .expect_err("engine failure");
        assert!(matches!(err, ChatError::Engine(EngineError::Http { .. })));
        assert!(chat.history("user-a", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_call_is_bounded_by_turn_timeout() {
        let generator = Arc::new(Scripted {
            replies: std::sync::Mutex::new(vec![collecting("late")].into()),
            delay: Duration::from_millis(200),
        });
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chat = ChatService::new(
            store.clone(),
            store,
            ExtractionEngine::new(generator).unwrap(),
            ChatSettings {
                turn_timeout: Duration::from_millis(20),
                max_message_chars: 200,
            },
        );
        let err = chat
            .submit_message("user-a", None, "hello")
            .await
            .expect_err("timeout");
        assert!(matches!(err, ChatError::Engine(EngineError::Timeout(_))));
        assert!(chat.history("user-a", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completed_conversation_materializes_once() {
        let (chat, store) = service(Scripted::new(vec![
            collecting("Hi, I'm Lead Generation Joe! What leads do you want?"),
            completing(),
            completing(),
        ]));

        let first = chat.submit_message("user-a", None, "tech startups").await.unwrap();
        assert!(!first.should_create_campaign);

        let done = chat
            .submit_message("user-a", None, "CEOs and founders in Sydney and Melbourne, Australia")
            .await
            .unwrap();
        assert!(done.should_create_campaign);
        let campaign = done.campaign.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Created);
        assert_eq!(campaign.progress, 0);
        assert_eq!(campaign.lead_count, 0);

        let again = chat
            .submit_message("user-a", None, "CEOs and founders in Sydney and Melbourne, Australia")
            .await
            .unwrap();
        assert!(!again.should_create_campaign);
        assert!(again.campaign.is_none());
        assert_eq!(again.reply, already_created_reply(&campaign.name));
        assert_eq!(store.campaigns_for_user("user-a").await.unwrap().len(), 1);
        assert_eq!(chat.history("user-a", None).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn materialization_failure_downgrades_response() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let chat = ChatService::new(
            store,
            Arc::new(BrokenCampaigns),
            ExtractionEngine::new(Scripted::new(vec![
                collecting("Hi, I'm Lead Generation Joe!"),
                completing(),
            ]))
            .unwrap(),
            settings(),
        );
        chat.submit_message("user-a", None, "tech startups").await.unwrap();
        let response = chat
            .submit_message("user-a", None, "CEOs in Sydney")
            .await
            .unwrap();
        assert!(!response.should_create_campaign);
        assert!(response.campaign.is_none());
        assert_eq!(
            response.materialization_error.unwrap().code,
            "materialization.failed"
        );
        // the assistant reply is still a valid turn
        assert_eq!(chat.history("user-a", None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn materialize_rejects_incomplete_parameters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let parameters = CampaignParameters {
            locations: Default::default(),
            business_types: ["saas".to_string()].into(),
            job_titles: ["ceo".to_string()].into(),
        };
        let err = materialize(
            &store,
            &ConversationKey::new("user-a", None),
            "SaaS CEOs",
            parameters,
        )
        .await
        .expect_err("incomplete");
        assert!(matches!(err, MaterializeError::Incomplete(ref m) if m == "location"));
        assert!(store.campaigns_for_user("user-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_for_one_conversation_do_not_interleave() {
        let (chat, _) = service(Arc::new(HistoryCounter));
        let chat = Arc::new(chat);

        let a = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.submit_message("user-a", Some("d1"), "first").await })
        };
        let b = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.submit_message("user-a", Some("d1"), "second").await })
        };
        let mut replies = vec![
            a.await.unwrap().unwrap().reply,
            b.await.unwrap().unwrap().reply,
        ];
        replies.sort();
        assert_eq!(
            replies,
            vec![
                "Lead Generation Joe saw 0 turns".to_string(),
                "Lead Generation Joe saw 2 turns".to_string()
            ]
        );

        let turns = chat.history("user-a", Some("d1")).await.unwrap();
        assert_eq!(turns.len(), 4);
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert!(chat.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_reply_write_leaves_no_half_turn() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.refuse_assistant_turns().await;
        let chat = ChatService::new(
            store.clone(),
            store.clone(),
            ExtractionEngine::new(Scripted::new(vec![collecting(
                "Hi, I'm Lead Generation Joe!",
            )]))
            .unwrap(),
            settings(),
        );

        let err = chat
            .submit_message("user-a", None, "tech startups")
            .await
            .expect_err("reply write refused");
        assert!(matches!(err, ChatError::Store(_)));
        assert!(chat.history("user-a", None).await.unwrap().is_empty());
    }
}
