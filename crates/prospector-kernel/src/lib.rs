use prospector_contracts::{
    CampaignParameters, CampaignStatus, ExtractionParameters, ExtractionPayload, ExtractionResult,
};
use std::collections::BTreeSet;
use thiserror::Error;

pub const ASSISTANT_NAME: &str = "Lead Generation Joe";

pub const MAX_CAMPAIGN_NAME_CHARS: usize = 50;

/// Ways a text-generation response can break the extraction contract after it
/// has already passed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("reply is blank")]
    EmptyReply,
    #[error("shouldCreateCampaign is true but campaignParameters is missing")]
    MissingParameters,
    #[error("shouldCreateCampaign is true but campaignName is missing or blank")]
    MissingCampaignName,
}

/// The three targeting categories a campaign needs, in the order they are asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    BusinessType,
    JobTitle,
    Location,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::BusinessType, Category::JobTitle, Category::Location];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::BusinessType => "business_type",
            Category::JobTitle => "job_title",
            Category::Location => "location",
        }
    }
}

/// Identifies one conversation: a user's global pre-campaign chat, or one draft.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub user_id: String,
    pub draft_id: Option<String>,
}

impl ConversationKey {
    pub fn new(user_id: &str, draft_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            draft_id: draft_id.map(|v| v.to_string()),
        }
    }

    /// Unambiguous string form used as the materialization marker column.
    pub fn storage_key(&self) -> String {
        match &self.draft_id {
            Some(draft) => format!("{}:{}/{}", self.user_id.len(), self.user_id, draft),
            None => format!("{}:{}", self.user_id.len(), self.user_id),
        }
    }
}

/// Lowercases, splits on whitespace, and rejoins the words with `+`.
/// A `+` inside a word is kept. Returns `None` for blank input.
pub fn normalize_token(raw: &str) -> Option<String> {
    let words: Vec<String> = raw.split_whitespace().map(|w| w.to_lowercase()).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join("+"))
    }
}

/// Normalizes a multi-value field. Items may themselves be comma-separated.
pub fn normalize_values<S: AsRef<str>>(items: &[S]) -> BTreeSet<String> {
    items
        .iter()
        .flat_map(|item| item.as_ref().split(','))
        .filter_map(normalize_token)
        .collect()
}

pub fn normalize_parameters(raw: &ExtractionParameters) -> CampaignParameters {
    CampaignParameters {
        locations: normalize_values(&raw.locations),
        business_types: normalize_values(&raw.business_types),
        job_titles: normalize_values(&raw.job_titles),
    }
}

pub fn is_complete(p: &CampaignParameters) -> bool {
    missing_categories(p).is_empty()
}

pub fn missing_categories(p: &CampaignParameters) -> Vec<Category> {
    Category::ALL
        .into_iter()
        .filter(|c| match c {
            Category::BusinessType => p.business_types.is_empty(),
            Category::JobTitle => p.job_titles.is_empty(),
            Category::Location => p.locations.is_empty(),
        })
        .collect()
}

pub fn clarifying_question(category: Category) -> &'static str {
    match category {
        Category::BusinessType => {
            "What type of businesses or industry should this campaign target? For example: tech startups, marketing agencies or SaaS companies."
        }
        Category::JobTitle => {
            "Which job titles or roles should I look for at those businesses? For example: CEO, founder or marketing director."
        }
        Category::Location => {
            "Which locations should the campaign cover? For example: Sydney Australia or New York USA."
        }
    }
}

pub fn introduction() -> String {
    format!(
        "Hi, I'm {ASSISTANT_NAME}! I help you build targeted lead generation campaigns. What kind of leads would you like to find?"
    )
}

pub fn self_identifies(reply: &str) -> bool {
    reply
        .to_lowercase()
        .contains(&ASSISTANT_NAME.to_lowercase())
}

pub fn already_created_reply(campaign_name: &str) -> String {
    format!(
        "Your campaign \"{campaign_name}\" has already been created from this conversation. Start a new conversation to set up another campaign."
    )
}

/// Trims the name and cuts it to at most fifty characters.
pub fn clamp_campaign_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let clamped: String = trimmed.chars().take(MAX_CAMPAIGN_NAME_CHARS).collect();
    Some(clamped.trim_end().to_string())
}

pub fn progress_for_status(status: CampaignStatus) -> u8 {
    match status {
        CampaignStatus::Created => 0,
        CampaignStatus::Scraped => 50,
        CampaignStatus::Researched => 75,
        CampaignStatus::Complete => 100,
    }
}

/// Instructions sent ahead of the conversation on every extraction call.
pub fn system_instructions() -> String {
    format!(
        r#"You are {ASSISTANT_NAME}, a friendly and professional assistant that helps users set up B2B lead generation campaigns.

Collect three kinds of targeting information from the user:
1. Business type or industry, e.g. "tech startups", "marketing agencies", "SaaS companies".
2. Job titles or roles, e.g. "CEO", "founder", "marketing director".
3. Geographic locations, e.g. "Sydney Australia", "New York USA".

Respond with a single JSON object and nothing else, using exactly these fields:
{{
  "reply": string,
  "shouldCreateCampaign": boolean,
  "campaignParameters": {{ "locations": [string], "businessTypes": [string], "jobTitles": [string] }} | null,
  "campaignName": string | null
}}

Rules:
- Set "shouldCreateCampaign" to true only once the conversation contains at least one value for every category. Otherwise set it to false, set "campaignParameters" and "campaignName" to null, and make "reply" a question about the missing category.
- When "shouldCreateCampaign" is true, fill "campaignParameters" with every value gathered so far and give a descriptive "campaignName" of at most {MAX_CAMPAIGN_NAME_CHARS} characters, e.g. "Tech Startup Leaders - Australia".
- Write parameter values in lowercase with spaces replaced by '+', e.g. "Los Angeles" becomes "los+angeles". Use one array entry per value.
- If this is the first message of the conversation, introduce yourself as {ASSISTANT_NAME} and ask what type of leads the user wants to target."#
    )
}

/// Applies the extraction policy to a schema-valid response.
///
/// The first turn never creates a campaign and always introduces the assistant.
/// A creation request whose parameters normalize to an incomplete set is
/// downgraded to a clarifying question for the first missing category.
pub fn settle_extraction(
    payload: ExtractionPayload,
    first_turn: bool,
) -> Result<ExtractionResult, ContractViolation> {
    let reply = payload.reply.trim().to_string();
    if reply.is_empty() {
        return Err(ContractViolation::EmptyReply);
    }

    if first_turn {
        return Ok(collecting(if self_identifies(&reply) {
            reply
        } else {
            introduction()
        }));
    }

    if !payload.should_create_campaign {
        return Ok(collecting(reply));
    }

    let raw = payload
        .campaign_parameters
        .ok_or(ContractViolation::MissingParameters)?;
    let name = payload
        .campaign_name
        .as_deref()
        .and_then(clamp_campaign_name)
        .ok_or(ContractViolation::MissingCampaignName)?;

    let parameters = normalize_parameters(&raw);
    if let Some(missing) = missing_categories(&parameters).first() {
        return Ok(collecting(clarifying_question(*missing).to_string()));
    }

    Ok(ExtractionResult {
        reply,
        should_create_campaign: true,
        campaign_parameters: Some(parameters),
        campaign_name: Some(name),
    })
}

fn collecting(reply: String) -> ExtractionResult {
    ExtractionResult {
        reply,
        should_create_campaign: false,
        campaign_parameters: None,
        campaign_name: None,
    }
}
