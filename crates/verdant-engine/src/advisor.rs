use std::fmt;

use serde_json::json;
use verdant_contracts::errors::ErrorKind;
use verdant_contracts::events::EventWriter;
use verdant_contracts::models::ModelChain;
use verdant_contracts::plant::{CareRecommendation, HealthAssessment, Identification};

use crate::backend::{
    ContentPart, ContentTurn, GenerateRequest, GenerationConfig, GenerativeBackend, Role,
};
use crate::classify::{classify, error_chain_text};
use crate::map_object;
use crate::parse::{self, ParseError};
use crate::preprocess::ImageData;

const IDENTIFY_PROMPT: &str = "\
You are a professional botanist with expertise in plant identification.
Analyze this plant image carefully and provide detailed identification information.

Pay special attention to:
- Leaf shape, arrangement, and venation
- Stem structure and color
- Any visible flowers or fruits
- Overall growth habit and form

Be particularly careful to distinguish between:
- Coffee plants (Coffea species) and Dracaena species
- Common houseplants that may look similar
- Young plants that may not have developed distinctive features yet

If you're uncertain about the exact species, indicate this in your confidence level.

Respond with a JSON object that includes:
{
  \"name\": \"Common name of the plant\",
  \"scientificName\": \"Scientific name (genus and species)\",
  \"confidence\": A number between 0-100 representing your confidence level,
  \"description\": \"A detailed description of the plant, including its characteristics and origin\",
  \"tags\": [\"Array\", \"of\", \"relevant\", \"tags\", \"like\", \"indoor\", \"flowering\", \"succulent\"]
}
Only respond with the JSON object, nothing else.";

const HEALTH_PROMPT: &str = "\
You are a plant pathologist and horticultural expert.
Analyze this plant image carefully and provide a detailed health assessment.

Pay special attention to:
- Leaf color, spots, or discoloration
- Signs of pests or pest damage
- Growth patterns and overall vigor
- Stem and branch condition
- Soil condition (if visible)

Respond with a JSON object that includes:
{
  \"status\": One of [\"Healthy\", \"Needs attention\", \"Unhealthy\"],
  \"summary\": \"A detailed summary of the plant's overall health condition\",
  \"issues\": [
    {
      \"name\": \"Name of the issue (e.g., 'Leaf yellowing')\",
      \"description\": \"Detailed description of the issue, including possible causes\",
      \"severity\": One of [\"low\", \"medium\", \"high\"],
      \"solution\": \"Specific recommended solution to address this issue\"
    }
  ]
}
If the plant appears healthy with no issues, return an empty array for issues.
Only respond with the JSON object, nothing else.";

const CARE_PROMPT_BODY: &str = "\
Include information about:
- Specific watering needs (frequency, amount, seasonal adjustments)
- Precise light requirements (intensity, duration, placement)
- Soil composition and drainage requirements
- Temperature range and humidity preferences
- Fertilization schedule and type
- Common issues to watch for and how to prevent them
- Pruning and maintenance tips
- Home remedies for healthy growth
- Cultural significance in ancient Hindu and Chinese traditions
- Recommended placement direction according to Vastu/Feng Shui principles

Respond with a JSON object that includes:
{
  \"watering\": \"Detailed watering instructions, including frequency and amount\",
  \"light\": \"Light requirements and placement recommendations\",
  \"soil\": \"Soil type and composition recommendations\",
  \"temperature\": \"Ideal temperature range\",
  \"humidity\": \"Recommended humidity levels and how to maintain them\",
  \"additionalTips\": \"Any additional care tips or special considerations\",
  \"summary\": \"A comprehensive summary of the care guide\",
  \"homeRemedies\": \"Natural home remedies to promote healthy growth of the plant\",
  \"culturalSignificance\": \"Cultural significance in ancient Hindu and Chinese traditions, including recommended placement direction according to Vastu/Feng Shui principles\"
}
Only respond with the JSON object, nothing else.";

pub const CHAT_PRIMER_USER: &str = "I want to talk about plants, gardening, and plant care. I might ask for identification help, care tips, or troubleshooting advice.";
pub const CHAT_PRIMER_MODEL: &str = "I'd be happy to discuss plants, gardening, and plant care with you! I can provide information on plant identification, care requirements, troubleshooting common issues, and general gardening advice. Feel free to ask any questions you have about your plants or gardening projects.";

pub const CHAT_GENERATION: GenerationConfig = GenerationConfig {
    temperature: 0.7,
    top_k: 40,
    top_p: 0.95,
    max_output_tokens: 1000,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AdvisorErrorKind {
    QuotaExceeded,
    Parse,
    Upstream,
}

impl AdvisorErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::Parse => "parse",
            Self::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdvisorError {
    pub kind: AdvisorErrorKind,
    /// Classifier verdict for the failure that ended the call.
    pub class: ErrorKind,
    pub message: String,
}

impl AdvisorError {
    fn from_backend(err: &anyhow::Error, class: ErrorKind) -> Self {
        let kind = if class == ErrorKind::Quota {
            AdvisorErrorKind::QuotaExceeded
        } else {
            AdvisorErrorKind::Upstream
        };
        Self {
            kind,
            class,
            message: error_chain_text(err, 1024),
        }
    }

    fn from_parse(err: ParseError) -> Self {
        Self {
            kind: AdvisorErrorKind::Parse,
            class: ErrorKind::Fatal,
            message: err.message,
        }
    }

    pub fn is_quota(&self) -> bool {
        self.kind == AdvisorErrorKind::QuotaExceeded
    }
}

impl fmt::Display for AdvisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl std::error::Error for AdvisorError {}

/// Plant identification, health assessment, care advice and expert chat over
/// a two-model chain. A failed primary call is retried once on the secondary
/// model unless the failure looks like quota exhaustion.
pub struct PlantAdvisor {
    backend: Box<dyn GenerativeBackend>,
    chain: ModelChain,
    events: EventWriter,
}

impl PlantAdvisor {
    pub fn new(backend: Box<dyn GenerativeBackend>, chain: ModelChain, events: EventWriter) -> Self {
        Self {
            backend,
            chain,
            events,
        }
    }

    pub fn chain(&self) -> &ModelChain {
        &self.chain
    }

    pub fn identify(&self, image: &ImageData) -> Result<Identification, AdvisorError> {
        let turns = vec![image_turn(IDENTIFY_PROMPT, image)];
        let text = self.generate_with_fallback("identify", turns, None)?;
        let object = parse::extract_json_object(&text).map_err(AdvisorError::from_parse)?;
        Ok(parse::identification_from(&object))
    }

    pub fn assess_health(&self, image: &ImageData) -> Result<HealthAssessment, AdvisorError> {
        let turns = vec![image_turn(HEALTH_PROMPT, image)];
        let text = self.generate_with_fallback("assess_health", turns, None)?;
        let object = parse::extract_json_object(&text).map_err(AdvisorError::from_parse)?;
        Ok(parse::health_from(&object))
    }

    pub fn recommend_care(
        &self,
        common_name: &str,
        scientific_name: Option<&str>,
    ) -> Result<CareRecommendation, AdvisorError> {
        let prompt = care_prompt(common_name, scientific_name);
        let turns = vec![ContentTurn::user_text(prompt)];
        let text = self.generate_with_fallback("recommend_care", turns, None)?;
        let object = parse::extract_json_object(&text).map_err(AdvisorError::from_parse)?;
        Ok(parse::care_from(&object, common_name))
    }

    /// `history` holds prior user/model turns after the fixed opening
    /// exchange, which is prepended here on every call.
    pub fn ask_expert(
        &self,
        history: &[ContentTurn],
        question: &str,
    ) -> Result<String, AdvisorError> {
        let mut turns = vec![
            ContentTurn::user_text(CHAT_PRIMER_USER),
            ContentTurn::model_text(CHAT_PRIMER_MODEL),
        ];
        turns.extend(history.iter().cloned());
        turns.push(ContentTurn::user_text(question.trim()));

        let reply = self.generate_with_fallback("ask_expert", turns, Some(CHAT_GENERATION))?;
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(AdvisorError::from_parse(ParseError {
                message: "expert reply was empty".to_string(),
            }));
        }
        let _ = self.events.emit(
            "chat_reply",
            map_object(json!({
                "chars": reply.chars().count(),
                "history_turns": history.len(),
            })),
        );
        Ok(reply)
    }

    fn generate_with_fallback(
        &self,
        operation: &str,
        turns: Vec<ContentTurn>,
        generation: Option<GenerationConfig>,
    ) -> Result<String, AdvisorError> {
        let mut request = GenerateRequest {
            model: self.chain.primary.name.clone(),
            turns,
            generation,
        };
        let primary_err = match self.backend.generate(&request) {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };
        let class = classify(&primary_err);
        if class == ErrorKind::Quota {
            return Err(AdvisorError::from_backend(&primary_err, class));
        }
        let Some(secondary) = self.chain.secondary.as_ref() else {
            return Err(AdvisorError::from_backend(&primary_err, class));
        };

        let _ = self.events.emit(
            "model_fallback",
            map_object(json!({
                "operation": operation,
                "from_model": request.model,
                "to_model": secondary.name,
                "classification": class.as_str(),
                "reason": error_chain_text(&primary_err, 512),
            })),
        );

        request.model = secondary.name.clone();
        self.backend.generate(&request).map_err(|err| {
            let class = classify(&err);
            AdvisorError::from_backend(&err, class)
        })
    }
}

fn image_turn(prompt: &str, image: &ImageData) -> ContentTurn {
    ContentTurn {
        role: Role::User,
        parts: vec![
            ContentPart::Text(prompt.to_string()),
            ContentPart::InlineImage {
                mime_type: image.mime_type.clone(),
                data: image.base64_payload(),
            },
        ],
    }
}

fn care_prompt(common_name: &str, scientific_name: Option<&str>) -> String {
    let subject = match scientific_name.map(str::trim).filter(|value| !value.is_empty()) {
        Some(scientific) => format!("{common_name} ({scientific})"),
        None => common_name.to_string(),
    };
    format!(
        "You are a professional horticulturist with expertise in plant care and cultural knowledge.\n\
         Provide detailed and specific care recommendations for {subject}.\n\n{CARE_PROMPT_BODY}"
    )
}
