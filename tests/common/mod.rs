#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use amybot::*;
use async_trait::async_trait;
use reqwest::StatusCode;

/// Text generator that records every prompt and answers with a fixed reply,
/// or fails when constructed with `failing()`.
pub struct RecordingGenerator {
    reply: Option<String>,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl RecordingGenerator {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TextGenerator for RecordingGenerator {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        match &self.reply {
            Some(r) => Ok(r.clone()),
            None => Err(ServiceError::HttpStatus(StatusCode::SERVICE_UNAVAILABLE)),
        }
    }
}

pub struct StaticImages {
    url: Option<String>,
    pub prompts: Mutex<Vec<String>>,
}

impl StaticImages {
    pub fn returning(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: Some(url.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            url: None,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ImageGenerator for StaticImages {
    async fn generate_image(&self, prompt: &str) -> Result<String, ServiceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.url.clone().ok_or(ServiceError::EmptyResponse)
    }
}

pub struct StaticPrices {
    pub btc: Option<f64>,
    pub oil: f64,
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn bitcoin_usd(&self) -> Result<f64, ServiceError> {
        self.btc.ok_or(ServiceError::EmptyResponse)
    }

    fn oil_usd(&self) -> f64 {
        self.oil
    }
}

pub fn flow_config(questions: &[&str]) -> FlowConfig {
    let m = default_messages(Lang::En);
    FlowConfig {
        questionnaire: Questionnaire::new(questions.iter().map(|q| q.to_string()).collect())
            .expect("at least one question"),
        begin_command: BEGIN_COMMAND.to_string(),
        cancel_command: CANCEL_COMMAND.to_string(),
        texts: FlowTexts {
            reprompt: m.reprompt,
            cancelled: m.cancelled,
            nothing_in_progress: m.nothing_in_progress,
            summary_fallback: m.summary_fallback,
            persona: m.persona,
            summary_instruction: m.summary_instruction,
        },
        summary_temperature: 0.7,
        summary_max_tokens: 600,
    }
}

pub fn engine(questions: &[&str], summarizer: Arc<RecordingGenerator>) -> FlowEngine {
    FlowEngine::new(flow_config(questions), SessionStore::in_memory(), summarizer)
}

pub fn config() -> Config {
    Config {
        lang: Lang::En,
        messages: default_messages(Lang::En),
        openai: OpenAiConfig {
            api_key: "sk-test".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            model: "gpt-4o-mini".to_string(),
            image_model: "dall-e-2".to_string(),
            image_size: "512x512".to_string(),
            timeout: Duration::from_secs(1),
        },
        chat_temperature: 0.1,
        chat_max_tokens: 200,
        summary_temperature: 0.7,
        summary_max_tokens: 600,
        price_api_url: "http://127.0.0.1:9/price".to_string(),
        oil_price_usd: 70.0,
        sessions_path: None,
        app_url: None,
        port: 5000,
    }
}
