use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::{env, fs, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use teloxide::{prelude::*, types::InputFile, update_listeners::webhooks};

pub mod error;
pub mod flow;
pub mod openai;
pub mod prices;

pub use error::ServiceError;
pub use flow::{
    FlowConfig, FlowEngine, FlowState, FlowTexts, OutboundMessage, Questionnaire, Session,
    SessionKey, SessionStore, Step,
};
pub use openai::{ImageGenerator, OpenAiClient, OpenAiConfig, Prompt, TextGenerator};
pub use prices::{CoinGeckoPrices, PriceSource};

/// Command that starts (or restarts) the YearCompass questionnaire.
pub const BEGIN_COMMAND: &str = "yearcompass";
/// Command that abandons the questionnaire.
pub const CANCEL_COMMAND: &str = "cancel";
pub const START_COMMAND: &str = "start";
pub const HELP_COMMAND: &str = "help";

/// Supported languages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lang {
    En,
    Ru,
}

/// Parse a short language tag into `Lang`. Locale forms like `ru-RU` are accepted.
pub fn parse_lang(s: &str) -> Option<Lang> {
    let lower = s.trim().to_lowercase();
    let prefix = lower.split(['-', '_']).next().unwrap_or("");
    match prefix {
        "en" => Some(Lang::En),
        "ru" => Some(Lang::Ru),
        _ => None,
    }
}

/// Return the short tag for a Lang variant (e.g. Lang::En -> "en").
pub fn lang_tag(l: &Lang) -> &'static str {
    match l {
        Lang::En => "en",
        Lang::Ru => "ru",
    }
}

/// User-visible texts, the assistant persona and the questionnaire, loaded
/// per language from `messages/<tag>.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct Messages {
    pub language_name: String,
    pub greeting: String,
    pub help: String,
    pub cannot_handle: String,
    pub nothing_in_progress: String,
    pub cancelled: String,
    pub reprompt: String,
    pub summary_fallback: String,
    pub chat_fallback: String,
    pub image_fallback: String,
    pub price_reply: String,
    pub price_unavailable: String,
    pub image_trigger: String,
    pub default_image_prompt: String,
    pub persona: String,
    pub summary_instruction: String,
    pub questions: Vec<String>,
}

/// Load a Messages struct from a given JSON file path, falling back to defaults
pub fn load_messages_file(path: &str, lang: Lang) -> Messages {
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!("failed to parse {}: {}. Falling back to defaults.", path, e);
            default_messages(lang)
        }),
        Err(e) => {
            tracing::warn!("failed to read {}: {}. Falling back to defaults.", path, e);
            default_messages(lang)
        }
    }
}

/// Load `<dir>/<tag>.json` for `lang`.
pub fn load_messages(dir: &str, lang: Lang) -> Messages {
    let path = format!("{}/{}.json", dir.trim_end_matches('/'), lang_tag(&lang));
    load_messages_file(&path, lang)
}

/// Built-in messages for a language, used when the catalogue file is missing or broken.
pub fn default_messages(lang: Lang) -> Messages {
    match lang {
        Lang::En => Messages {
            language_name: "English".to_string(),
            greeting: "Hi! I'm AmyBot. Write me anything, send /yearcompass to reflect on your year, or /help to see what I can do.".to_string(),
            help: "Just write to chat with me.\n\"{image_trigger} ...\" draws a picture.\nA message with $ shows Bitcoin and oil prices.\n/{begin} starts the YearCompass questionnaire, /{cancel} stops it.".to_string(),
            cannot_handle: "I can't handle messages without a user.".to_string(),
            nothing_in_progress: "Nothing is in progress. Send /yearcompass to start the questionnaire.".to_string(),
            cancelled: "Questionnaire cancelled. Send /yearcompass whenever you want to start again.".to_string(),
            reprompt: "Please answer the question in plain text, or send /cancel to stop.\n\n{question}".to_string(),
            summary_fallback: "Sorry, I couldn't put your answers together right now. Thank you for sharing them!".to_string(),
            chat_fallback: "Oops, something went wrong while asking the AI. Let's try again later.".to_string(),
            image_fallback: "Sorry, I couldn't draw that picture.".to_string(),
            price_reply: "Bitcoin: ${btc}, oil: ${oil} per barrel".to_string(),
            price_unavailable: "N/A".to_string(),
            image_trigger: "amybot, draw".to_string(),
            default_image_prompt: "a beautiful picture".to_string(),
            persona: "You are AmyBot, a creative professional who loves coffee, gadgets and travel. Answer to the point, but make it interesting.".to_string(),
            summary_instruction: "The user has just finished the YearCompass reflection. Write a warm, encouraging summary of their year and of their intentions for the next one, based on the answers below.".to_string(),
            questions: vec![
                "What happened in your past year? Go through it month by month and note the important events.".to_string(),
                "What were the biggest achievements of your past year?".to_string(),
                "What were the biggest challenges, and who or what helped you overcome them?".to_string(),
                "What did you learn about yourself over the past year?".to_string(),
                "Which people influenced you the most last year?".to_string(),
                "What are you most grateful for from the past year?".to_string(),
                "What do you want to let go of before the new year begins?".to_string(),
                "What do you want your next year to look like? Describe it in a few sentences.".to_string(),
                "Pick one word that will define your next year.".to_string(),
            ],
        },
        Lang::Ru => Messages {
            language_name: "Русский".to_string(),
            greeting: "Привет! Я AmyBot. Напиши мне что-нибудь, отправь /yearcompass, чтобы подвести итоги года, или /help, чтобы узнать, что я умею.".to_string(),
            help: "Просто напиши мне, чтобы поговорить.\n\"{image_trigger} ...\" нарисует картинку.\nСообщение со знаком $ покажет цены на биткоин и нефть.\n/{begin} запускает опрос YearCompass, /{cancel} его прерывает.".to_string(),
            cannot_handle: "Я не могу обработать сообщение без пользователя.".to_string(),
            nothing_in_progress: "Сейчас ничего не идёт. Отправь /yearcompass, чтобы начать опрос.".to_string(),
            cancelled: "Опрос отменён. Отправь /yearcompass, когда захочешь начать заново.".to_string(),
            reprompt: "Пожалуйста, ответь на вопрос обычным текстом или отправь /cancel, чтобы остановиться.\n\n{question}".to_string(),
            summary_fallback: "Извини, сейчас не получилось подвести итоги. Спасибо, что поделился!".to_string(),
            chat_fallback: "Упс, что-то пошло не так при запросе к OpenAI.".to_string(),
            image_fallback: "Извини, не получилось нарисовать картинку.".to_string(),
            price_reply: "Биткоин: ${btc}, нефть: ${oil} за баррель".to_string(),
            price_unavailable: "N/A".to_string(),
            image_trigger: "amybot, нарисуй".to_string(),
            default_image_prompt: "красивая картинка".to_string(),
            persona: "Ты — AmyBot, креативный профессионал. Любишь кофе, гаджеты и путешествия. Отвечай по существу, но интересно.".to_string(),
            summary_instruction: "Пользователь только что прошёл опрос YearCompass. Напиши тёплое, ободряющее резюме его года и планов на следующий, опираясь на ответы ниже.".to_string(),
            questions: vec![
                "Что произошло в твоём прошедшем году? Пройдись по месяцам и отметь важные события.".to_string(),
                "Какие были самые большие достижения прошедшего года?".to_string(),
                "Какие были самые большие трудности, и кто или что помогло их преодолеть?".to_string(),
                "Что ты узнал о себе за прошедший год?".to_string(),
                "Какие люди повлияли на тебя больше всего?".to_string(),
                "За что ты больше всего благодарен прошедшему году?".to_string(),
                "Что ты хочешь отпустить до начала нового года?".to_string(),
                "Каким ты хочешь видеть следующий год? Опиши в нескольких предложениях.".to_string(),
                "Выбери одно слово, которое определит твой следующий год.".to_string(),
            ],
        },
    }
}

/// Simple template formatter: replace `{key}` with `value` for each pair in `pairs`.
pub fn format_with(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut s = template.to_string();
    for (k, v) in pairs {
        s = s.replace(&format!("{{{}}}", k), v);
    }
    s
}

/// Runtime configuration (from environment with sensible defaults)
#[derive(Clone, Debug)]
pub struct Config {
    pub lang: Lang,
    pub messages: Messages,
    pub openai: OpenAiConfig,
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
    pub summary_temperature: f32,
    pub summary_max_tokens: u32,
    pub price_api_url: String,
    pub oil_price_usd: f64,
    // when set, in-progress questionnaires are mirrored to this JSON file
    pub sessions_path: Option<PathBuf>,
    // public HTTPS url Telegram posts updates to; long polling when unset
    pub app_url: Option<String>,
    pub port: u16,
}

pub type SharedConfig = Arc<Config>;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let lang = env::var("BOT_LANG")
            .ok()
            .and_then(|v| parse_lang(&v))
            .unwrap_or(Lang::En);
        let messages_dir = env::var("MESSAGES_DIR").unwrap_or_else(|_| "messages".to_string());

        let api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let openai = OpenAiConfig {
            api_key,
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            image_model: env::var("OPENAI_IMAGE_MODEL")
                .unwrap_or_else(|_| "dall-e-2".to_string()),
            image_size: env::var("OPENAI_IMAGE_SIZE").unwrap_or_else(|_| "512x512".to_string()),
            timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 30)),
        };

        let cfg = Config {
            lang,
            messages: load_messages(&messages_dir, lang),
            openai,
            chat_temperature: env_or("CHAT_TEMPERATURE", 0.1),
            chat_max_tokens: env_or("CHAT_MAX_TOKENS", 200),
            summary_temperature: env_or("SUMMARY_TEMPERATURE", 0.7),
            summary_max_tokens: env_or("SUMMARY_MAX_TOKENS", 600),
            price_api_url: env::var("PRICE_API_URL")
                .unwrap_or_else(|_| prices::COINGECKO_BTC_URL.to_string()),
            oil_price_usd: env_or("OIL_PRICE_USD", 70.0),
            sessions_path: env::var("SESSIONS_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            app_url: env::var("APP_URL").ok().filter(|u| !u.trim().is_empty()),
            port: env_or("PORT", 5000),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.openai.api_key.trim().is_empty() {
            anyhow::bail!("Invalid configuration: OPENAI_API_KEY must not be empty.");
        }
        if self.openai.timeout.is_zero() {
            anyhow::bail!("Invalid configuration: REQUEST_TIMEOUT_SECS must be a positive integer.");
        }
        if self.messages.questions.is_empty() {
            anyhow::bail!(
                "Invalid configuration: the {} message catalogue has no questions.",
                lang_tag(&self.lang)
            );
        }
        if !(0.0..=2.0).contains(&self.chat_temperature)
            || !(0.0..=2.0).contains(&self.summary_temperature)
        {
            anyhow::bail!(
                "Invalid configuration: CHAT_TEMPERATURE ({}) and SUMMARY_TEMPERATURE ({}) must be within 0..=2.",
                self.chat_temperature,
                self.summary_temperature
            );
        }
        if self.webhook_url()?.is_some() && self.port == 0 {
            anyhow::bail!("Invalid configuration: PORT must be a positive integer in webhook mode.");
        }
        Ok(())
    }

    /// The webhook url, if the bot should receive updates through a webhook.
    pub fn webhook_url(&self) -> Result<Option<reqwest::Url>> {
        let Some(raw) = self.app_url.as_deref() else {
            return Ok(None);
        };
        let url = reqwest::Url::parse(raw.trim())
            .with_context(|| format!("Invalid configuration: APP_URL {:?} is not a URL.", raw))?;
        if url.scheme() != "https" {
            anyhow::bail!("Invalid configuration: APP_URL must be an https URL, got {}.", url);
        }
        Ok(Some(url))
    }

    /// Questionnaire settings for the flow engine.
    pub fn flow_config(&self) -> Result<FlowConfig> {
        let m = &self.messages;
        let questionnaire = Questionnaire::new(m.questions.clone())
            .context("the questionnaire needs at least one question")?;
        Ok(FlowConfig {
            questionnaire,
            begin_command: BEGIN_COMMAND.to_string(),
            cancel_command: CANCEL_COMMAND.to_string(),
            texts: FlowTexts {
                reprompt: m.reprompt.clone(),
                cancelled: m.cancelled.clone(),
                nothing_in_progress: m.nothing_in_progress.clone(),
                summary_fallback: m.summary_fallback.clone(),
                persona: m.persona.clone(),
                summary_instruction: m.summary_instruction.clone(),
            },
            summary_temperature: self.summary_temperature,
            summary_max_tokens: self.summary_max_tokens,
        })
    }
}

/// Everything a message handler needs.
pub struct BotContext {
    pub config: SharedConfig,
    pub engine: FlowEngine,
    pub chat: Arc<dyn TextGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub prices: Arc<dyn PriceSource>,
}

/// What to send back for one incoming text.
#[derive(Clone, Debug, PartialEq)]
pub enum BotReply {
    Text(String),
    /// URL of an image to send as a photo.
    Photo(String),
    Nothing,
}

/// Where text that is not part of a questionnaire goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Start,
    Help,
    UnknownCommand,
    Image(&'a str),
    Price,
    Chat,
}

/// If `text` starts with `trigger` (case-insensitively), return the rest, trimmed.
pub fn strip_trigger<'a>(text: &'a str, trigger: &str) -> Option<&'a str> {
    if trigger.trim().is_empty() {
        return None;
    }
    let text = text.trim_start();
    let n = trigger.chars().count();
    let end = match text.char_indices().nth(n) {
        Some((i, _)) => i,
        None if text.chars().count() == n => text.len(),
        None => return None,
    };
    if text[..end].to_lowercase() == trigger.to_lowercase() {
        Some(text[end..].trim())
    } else {
        None
    }
}

pub fn route<'a>(text: &'a str, messages: &Messages) -> Route<'a> {
    if let Some(name) = flow::command_name(text) {
        return if name.eq_ignore_ascii_case(START_COMMAND) {
            Route::Start
        } else if name.eq_ignore_ascii_case(HELP_COMMAND) {
            Route::Help
        } else {
            Route::UnknownCommand
        };
    }
    if let Some(prompt) = strip_trigger(text, &messages.image_trigger) {
        return Route::Image(prompt);
    }
    if text.contains('$') {
        return Route::Price;
    }
    Route::Chat
}

/// Decide the reply for a text message from `key`. Active questionnaires take
/// precedence; everything else is routed to the assistant features.
pub async fn reply_for(ctx: &BotContext, key: SessionKey, text: &str) -> BotReply {
    let messages = &ctx.config.messages;

    let idle_text = match ctx.engine.submit_answer(key, text).await {
        OutboundMessage::NoActiveSession(t) => t,
        outcome => return BotReply::Text(outcome.text().to_string()),
    };

    if text.trim().is_empty() {
        return BotReply::Nothing;
    }

    match route(text, messages) {
        Route::Start => BotReply::Text(messages.greeting.clone()),
        Route::Help => BotReply::Text(format_with(
            &messages.help,
            &[
                ("image_trigger", &messages.image_trigger),
                ("begin", BEGIN_COMMAND),
                ("cancel", CANCEL_COMMAND),
            ],
        )),
        Route::UnknownCommand => BotReply::Text(idle_text),
        Route::Image(prompt) => {
            let prompt = if prompt.is_empty() {
                messages.default_image_prompt.as_str()
            } else {
                prompt
            };
            match ctx.images.generate_image(prompt).await {
                Ok(url) => BotReply::Photo(url),
                Err(e) => {
                    tracing::warn!("image generation failed for {}: {}", key, e);
                    BotReply::Text(messages.image_fallback.clone())
                }
            }
        }
        Route::Price => {
            let btc = match ctx.prices.bitcoin_usd().await {
                Ok(v) => prices::format_price(v),
                Err(e) => {
                    tracing::warn!("bitcoin price lookup failed: {}", e);
                    messages.price_unavailable.clone()
                }
            };
            let oil = prices::format_price(ctx.prices.oil_usd());
            BotReply::Text(format_with(
                &messages.price_reply,
                &[("btc", &btc), ("oil", &oil)],
            ))
        }
        Route::Chat => {
            let prompt = Prompt {
                system: messages.persona.clone(),
                user: text.trim().to_string(),
                temperature: ctx.config.chat_temperature,
                max_tokens: ctx.config.chat_max_tokens,
            };
            match ctx.chat.complete(&prompt).await {
                Ok(answer) => BotReply::Text(answer),
                Err(e) => {
                    tracing::warn!("chat completion failed for {}: {}", key, e);
                    BotReply::Text(messages.chat_fallback.clone())
                }
            }
        }
    }
}

/// Handle an incoming message and send the reply.
async fn handle_message(bot: &Bot, msg: &Message, ctx: Arc<BotContext>) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        bot.send_message(msg.chat.id, ctx.config.messages.cannot_handle.clone())
            .await?;
        return Ok(());
    };
    let key = SessionKey::new(msg.chat.id.0, user.id.0);

    match reply_for(&ctx, key, text).await {
        BotReply::Text(reply) => {
            bot.send_message(msg.chat.id, reply).await?;
        }
        BotReply::Photo(url) => match reqwest::Url::parse(&url) {
            Ok(parsed) => {
                bot.send_photo(msg.chat.id, InputFile::url(parsed)).await?;
            }
            Err(e) => {
                tracing::warn!("image service returned an invalid url {:?}: {}", url, e);
                bot.send_message(msg.chat.id, ctx.config.messages.image_fallback.clone())
                    .await?;
            }
        },
        BotReply::Nothing => {}
    }
    Ok(())
}

/// Run the bot. Separated from `main` so tests can import the library.
pub async fn run_bot() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv().ok();
    let bot = Bot::from_env();

    let config = Arc::new(Config::from_env()?);
    let flow_config = config.flow_config()?;
    let webhook = config.webhook_url()?;
    let port = config.port;

    let store = match &config.sessions_path {
        Some(path) => SessionStore::persistent(path.clone(), &flow_config.questionnaire),
        None => SessionStore::in_memory(),
    };

    let client = Arc::new(OpenAiClient::new(config.openai.clone())?);
    let prices = Arc::new(CoinGeckoPrices::new(
        config.price_api_url.clone(),
        config.oil_price_usd,
        config.openai.timeout,
    )?);

    tracing::info!(
        "starting AmyBot: lang={} model={} questions={}",
        lang_tag(&config.lang),
        client.model(),
        flow_config.questionnaire.len()
    );

    let ctx = Arc::new(BotContext {
        config,
        engine: FlowEngine::new(flow_config, store, client.clone()),
        chat: client.clone(),
        images: client,
        prices,
    });

    let handler = move |bot: Bot, msg: Message| {
        let ctx = ctx.clone();
        async move {
            if let Err(err) = handle_message(&bot, &msg, ctx).await {
                tracing::error!("handler error: {:?}", err);
            }
            respond(())
        }
    };

    match webhook {
        Some(url) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!("receiving updates via webhook {} on {}", url, addr);
            let listener =
                webhooks::axum(bot.clone(), webhooks::Options::new(addr, url)).await?;
            teloxide::repl_with_listener(bot, handler, listener).await;
        }
        None => {
            tracing::info!("receiving updates via long polling");
            teloxide::repl(bot, handler).await;
        }
    }

    Ok(())
}
