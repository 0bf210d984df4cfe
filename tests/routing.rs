mod common;

use std::sync::Arc;

use amybot::*;
use common::{RecordingGenerator, StaticImages, StaticPrices};

const KEY: SessionKey = SessionKey {
    chat_id: 42,
    user_id: 1,
};

struct Harness {
    ctx: BotContext,
    summarizer: Arc<RecordingGenerator>,
    chat: Arc<RecordingGenerator>,
    images: Arc<StaticImages>,
}

fn harness(
    chat: Arc<RecordingGenerator>,
    images: Arc<StaticImages>,
    btc: Option<f64>,
) -> Harness {
    let config = Arc::new(common::config());
    let summarizer = RecordingGenerator::replying("Your year in review");
    let engine = FlowEngine::new(
        config.flow_config().unwrap(),
        SessionStore::in_memory(),
        summarizer.clone(),
    );
    let ctx = BotContext {
        config,
        engine,
        chat: chat.clone(),
        images: images.clone(),
        prices: Arc::new(StaticPrices { btc, oil: 70.0 }),
    };
    Harness {
        ctx,
        summarizer,
        chat,
        images,
    }
}

fn default_harness() -> Harness {
    harness(
        RecordingGenerator::replying("Hello from the model"),
        StaticImages::returning("https://images.example/cat.png"),
        Some(64250.5),
    )
}

#[test]
fn route_classifies_text() {
    let m = default_messages(Lang::En);
    assert_eq!(route("/start", &m), Route::Start);
    assert_eq!(route("/help@amy_bot", &m), Route::Help);
    assert_eq!(route("/weather", &m), Route::UnknownCommand);
    assert_eq!(route("AmyBot, draw a red fox", &m), Route::Image("a red fox"));
    assert_eq!(route("how much is $btc?", &m), Route::Price);
    assert_eq!(route("tell me a joke", &m), Route::Chat);

    let ru = default_messages(Lang::Ru);
    assert_eq!(route("Amybot, нарисуй кота", &ru), Route::Image("кота"));
}

#[tokio::test]
async fn start_and_help_replies() {
    let h = default_harness();
    let m = &h.ctx.config.messages;

    assert_eq!(
        reply_for(&h.ctx, KEY, "/start").await,
        BotReply::Text(m.greeting.clone())
    );
    match reply_for(&h.ctx, KEY, "/help").await {
        BotReply::Text(t) => {
            assert!(t.contains("/yearcompass"), "help was: {}", t);
            assert!(t.contains("/cancel"), "help was: {}", t);
            assert!(t.contains("amybot, draw"), "help was: {}", t);
        }
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn unknown_command_while_idle_says_nothing_in_progress() {
    let h = default_harness();
    assert_eq!(
        reply_for(&h.ctx, KEY, "/weather").await,
        BotReply::Text(h.ctx.config.messages.nothing_in_progress.clone())
    );
}

#[tokio::test]
async fn plain_text_goes_to_chat_with_persona() {
    let h = default_harness();
    assert_eq!(
        reply_for(&h.ctx, KEY, "  what's new?  ").await,
        BotReply::Text("Hello from the model".to_string())
    );
    let prompt = h.chat.last_prompt().unwrap();
    assert_eq!(prompt.system, h.ctx.config.messages.persona);
    assert_eq!(prompt.user, "what's new?");
    assert_eq!(prompt.max_tokens, 200);
    assert!((prompt.temperature - 0.1).abs() < f32::EPSILON);
}

#[tokio::test]
async fn chat_failure_uses_fallback() {
    let h = harness(
        RecordingGenerator::failing(),
        StaticImages::failing(),
        None,
    );
    assert_eq!(
        reply_for(&h.ctx, KEY, "hello").await,
        BotReply::Text(h.ctx.config.messages.chat_fallback.clone())
    );
}

#[tokio::test]
async fn image_trigger_generates_photo() {
    let h = default_harness();
    assert_eq!(
        reply_for(&h.ctx, KEY, "amybot, draw a lighthouse at dusk").await,
        BotReply::Photo("https://images.example/cat.png".to_string())
    );
    assert_eq!(
        h.images.prompts.lock().unwrap().as_slice(),
        ["a lighthouse at dusk"]
    );

    reply_for(&h.ctx, KEY, "AMYBOT, DRAW").await;
    assert_eq!(
        h.images.prompts.lock().unwrap().last().unwrap(),
        &h.ctx.config.messages.default_image_prompt
    );
    assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn image_failure_uses_fallback() {
    let h = harness(
        RecordingGenerator::replying("unused"),
        StaticImages::failing(),
        None,
    );
    assert_eq!(
        reply_for(&h.ctx, KEY, "amybot, draw a cat").await,
        BotReply::Text(h.ctx.config.messages.image_fallback.clone())
    );
}

#[tokio::test]
async fn dollar_sign_replies_with_prices() {
    let h = default_harness();
    assert_eq!(
        reply_for(&h.ctx, KEY, "$").await,
        BotReply::Text("Bitcoin: $64250.50, oil: $70 per barrel".to_string())
    );

    let down = harness(
        RecordingGenerator::replying("unused"),
        StaticImages::failing(),
        None,
    );
    assert_eq!(
        reply_for(&down.ctx, KEY, "price in $ please").await,
        BotReply::Text("Bitcoin: $N/A, oil: $70 per barrel".to_string())
    );
}

#[tokio::test]
async fn blank_text_while_idle_is_ignored() {
    let h = default_harness();
    assert_eq!(reply_for(&h.ctx, KEY, "   ").await, BotReply::Nothing);
    assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn active_questionnaire_takes_precedence_over_routing() {
    let h = default_harness();
    let questions = h.ctx.config.messages.questions.clone();

    assert_eq!(
        reply_for(&h.ctx, KEY, "/yearcompass").await,
        BotReply::Text(questions[0].clone())
    );
    // would otherwise be a price lookup, an image and a chat message
    assert_eq!(
        reply_for(&h.ctx, KEY, "I saved $500").await,
        BotReply::Text(questions[1].clone())
    );
    assert_eq!(
        reply_for(&h.ctx, KEY, "amybot, draw my year").await,
        BotReply::Text(questions[2].clone())
    );
    match reply_for(&h.ctx, KEY, "/start").await {
        BotReply::Text(t) => assert!(t.contains(&questions[2]), "reprompt was: {}", t),
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(h.chat.calls(), 0);
    assert!(h.images.prompts.lock().unwrap().is_empty());

    for i in 2..questions.len() - 1 {
        reply_for(&h.ctx, KEY, &format!("answer {}", i)).await;
    }
    assert_eq!(h.summarizer.calls(), 0);
    assert_eq!(
        reply_for(&h.ctx, KEY, "last answer").await,
        BotReply::Text("Your year in review".to_string())
    );
    assert_eq!(h.summarizer.calls(), 1);
    assert_eq!(h.ctx.engine.state(KEY).await, FlowState::Idle);

    // after completion plain text goes back to chat
    assert_eq!(
        reply_for(&h.ctx, KEY, "thanks").await,
        BotReply::Text("Hello from the model".to_string())
    );
}

#[tokio::test]
async fn cancel_mid_questionnaire_acknowledges() {
    let h = default_harness();
    reply_for(&h.ctx, KEY, "/yearcompass").await;
    reply_for(&h.ctx, KEY, "first").await;
    assert_eq!(
        reply_for(&h.ctx, KEY, "/cancel").await,
        BotReply::Text(h.ctx.config.messages.cancelled.clone())
    );
    assert_eq!(h.ctx.engine.active_sessions().await, 0);
    assert_eq!(h.summarizer.calls(), 0);
}
