use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const API_VERSION: &str = "1.0.0";

pub const EXTRACTION_RESULT_SCHEMA: &str = "../contracts/v1/extraction_result.schema.json";

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub path: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(path, sha256, body)| ContractSchemaManifest { path, sha256, body })
            .collect(),
    }
}

/// Embedded body of a contract schema, looked up by its `../contracts/v1/...` reference.
pub fn schema_body(path: &str) -> Option<&'static str> {
    GENERATED_CONTRACT_SCHEMAS
        .iter()
        .find(|(p, _, _)| *p == path)
        .map(|(_, _, body)| *body)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One immutable chat message. Turns are append-only and ordered by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConversationTurn {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub campaign_draft_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// Normalized targeting tokens. Every token is lowercase and `+`-joined.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CampaignParameters {
    pub locations: BTreeSet<String>,
    pub business_types: BTreeSet<String>,
    pub job_titles: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Created,
    Scraped,
    Researched,
    Complete,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Created => "created",
            CampaignStatus::Scraped => "scraped",
            CampaignStatus::Researched => "researched",
            CampaignStatus::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(CampaignStatus::Created),
            "scraped" => Some(CampaignStatus::Scraped),
            "researched" => Some(CampaignStatus::Researched),
            "complete" => Some(CampaignStatus::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub parameters: CampaignParameters,
    pub status: CampaignStatus,
    pub progress: u8,
    pub lead_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameter lists exactly as the text-generation service emits them, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionParameters {
    pub locations: Vec<String>,
    pub business_types: Vec<String>,
    pub job_titles: Vec<String>,
}

/// Wire shape of one text-generation response. Validated against
/// `extraction_result.schema.json` before it is deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionPayload {
    pub reply: String,
    pub should_create_campaign: bool,
    #[serde(default)]
    pub campaign_parameters: Option<ExtractionParameters>,
    #[serde(default)]
    pub campaign_name: Option<String>,
}

/// Settled outcome of one extraction. `campaign_parameters` and `campaign_name`
/// are present exactly when `should_create_campaign` is true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionResult {
    pub reply: String,
    pub should_create_campaign: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_parameters: Option<CampaignParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub campaign_draft_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub should_create_campaign: bool,
    pub campaign: Option<Campaign>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization_error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DraftCreated {
    pub campaign_draft_id: String,
}

/// Callback from the workflow-automation system. Fields it adds beyond these are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignUpdate {
    pub user_id: String,
    pub campaign_id: String,
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub lead_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractsMetadata {
    pub api_version: String,
    pub contracts_set_sha256: String,
    pub generated_at: String,
    pub schemas: BTreeMap<String, String>,
}

impl ContractsMetadata {
    pub fn current() -> Self {
        let manifest = contracts_manifest_v1();
        Self {
            api_version: API_VERSION.to_string(),
            contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
            generated_at: manifest.generated_at.to_string(),
            schemas: manifest
                .schemas
                .iter()
                .map(|s| (s.path.to_string(), s.sha256.to_string()))
                .collect(),
        }
    }
}
