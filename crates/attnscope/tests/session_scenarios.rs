use async_trait::async_trait;
use attnscope::{
    ChatMessage, ChatStreamRequest, Correlated, ErrorCategory, EventStream, FullAttentionRequest,
    FullAttentionResponse, GenerationOutcome, InspectClient, InspectError, InspectorBackend,
    InspectorConfig, InspectorSession, PlaybackState, Role, StreamEvent, TokenEvent, TraceEvent,
};
use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method, path},
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn setup() -> (MockServer, InspectClient, InspectorConfig) {
    init_logging();
    let server = MockServer::start().await;
    info!("Mock server started at: {}", server.uri());
    let config = InspectorConfig::default().api_base_url(server.uri());
    let client = InspectClient::from_config(&config).unwrap();
    (server, client, config)
}

const TOKEN_TRACE_DONE: &str = "event: token\n\
data: {\"step\":0,\"token_id\":104,\"token_text\":\"h\",\"token_display\":\"h\"}\n\n\
event: trace\n\
data: {\"step\":0,\"entropy\":0.7,\"topk\":[{\"token_id\":104,\"token_text\":\"h\",\"token_display\":\"h\",\"prob\":0.8}],\"attn\":[[0.1,0.2,0.7],[0.3,0.3,0.4]]}\n\n\
event: done\n\
data: {\"reply\":\"hi\"}\n\n";

#[tokio::test]
async fn test_token_trace_done_completes_generation() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": config.system_prompt},
                {"role": "user", "content": "hello"}
            ],
            "seed": 42,
            "trace_layer": 0
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(TOKEN_TRACE_DONE, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut session = InspectorSession::from_config(&config);
    let mut effects = Vec::new();
    let outcome = session
        .send(&client, &config, "hello", CancellationToken::new(), |effect, _| {
            effects.push(effect.clone())
        })
        .await;

    let GenerationOutcome::Completed { reply } = outcome else {
        panic!("generation did not complete");
    };
    assert_eq!(reply, "hi");
    assert_eq!(
        effects,
        vec![
            Correlated::Token {
                step: 0,
                text: "h".into()
            },
            Correlated::Steps(0..1),
            Correlated::Completed {
                reply: "hi".into()
            },
        ]
    );

    assert_eq!(session.steps().len(), 1);
    assert_eq!(session.steps()[0].head_count(), 2);
    assert_eq!(session.partial(), "");
    assert_eq!(session.history().last(), Some(&ChatMessage::assistant("hi")));
    assert_eq!(session.playback(), PlaybackState::Paused);

    let view = session.view().unwrap();
    assert_eq!(view.track.attention.prompt_len, 2);
    assert_eq!(view.track.attention.weights, vec![0.7]);
    assert_eq!(view.insight.candidates.len(), 1);
    assert!(view.insight.candidates[0].chosen);
}

#[tokio::test]
async fn test_step_records_are_visible_before_done() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(TOKEN_TRACE_DONE, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let mut session = InspectorSession::from_config(&config);
    let mut live: Vec<(f32, Vec<f32>)> = Vec::new();
    let mut completed_after_steps = false;
    session
        .send(&client, &config, "hello", CancellationToken::new(), |effect, steps| {
            match effect {
                Correlated::Steps(range) => {
                    for record in &steps[range.clone()] {
                        let row = record.attention_row(0).unwrap_or_default().to_vec();
                        live.push((record.entropy, row));
                    }
                }
                Correlated::Completed { .. } => completed_after_steps = !live.is_empty(),
                Correlated::Token { .. } => {}
            }
        })
        .await;

    assert_eq!(live, vec![(0.7, vec![0.1, 0.2, 0.7])]);
    assert!(completed_after_steps);
}

#[tokio::test]
async fn test_rate_limited_response_surfaces_category() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": "Rate limit exceeded",
            "code": "rate_limited"
        })))
        .mount(&server)
        .await;

    let mut session = InspectorSession::from_config(&config);
    let outcome = session
        .send(&client, &config, "hello", CancellationToken::new(), |_, _| {})
        .await;

    let surfaced = outcome.surfaced_error().unwrap();
    assert_eq!(surfaced.category, ErrorCategory::RateLimited);
    assert_eq!(
        surfaced.message,
        "Rate limited. Please wait before sending another message."
    );
    let GenerationOutcome::Failed { error } = outcome else {
        panic!("expected a failed generation");
    };
    assert!(matches!(error, InspectError::Api { status: 429, .. }));

    assert!(session.steps().is_empty());
    assert_eq!(session.playback(), PlaybackState::Idle);
    let roles: Vec<Role> = session.history().messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User]);
}

#[tokio::test]
async fn test_prompt_too_large_response_surfaces_category() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "Prompt too large: 20000 bytes (max 16384)",
            "code": "prompt_too_large"
        })))
        .mount(&server)
        .await;

    let mut session = InspectorSession::from_config(&config);
    let outcome = session
        .send(&client, &config, "x", CancellationToken::new(), |_, _| {})
        .await;
    assert_eq!(
        outcome.surfaced_error().map(|e| e.category),
        Some(ErrorCategory::PromptTooLarge)
    );
}

/// Streams three complete steps, then never sends `done`.
struct StallingBackend;

#[async_trait]
impl InspectorBackend for StallingBackend {
    async fn stream_chat(
        &self,
        _request: &ChatStreamRequest,
        _cancel: CancellationToken,
    ) -> attnscope::Result<EventStream> {
        let mut events: Vec<attnscope::Result<StreamEvent>> = Vec::new();
        for (step, text) in ["a", "b", "c"].into_iter().enumerate() {
            events.push(Ok(StreamEvent::Token(TokenEvent {
                step,
                token_id: u32::from(text.as_bytes()[0]),
                token_text: text.to_string(),
                token_display: text.to_string(),
            })));
            events.push(Ok(StreamEvent::Trace(TraceEvent {
                step,
                entropy: 1.0,
                topk: vec![],
                attn: vec![vec![0.25; step + 2]],
            })));
        }
        Ok(stream::iter(events).chain(stream::pending()).boxed())
    }

    async fn full_attention(
        &self,
        _request: &FullAttentionRequest,
    ) -> attnscope::Result<FullAttentionResponse> {
        Err(InspectError::Stream("not served".into()))
    }

    async fn health(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_cancel_after_three_steps_keeps_partial() {
    init_logging();
    let config = InspectorConfig::default();
    let mut session = InspectorSession::from_config(&config);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let outcome = session
        .send(&StallingBackend, &config, "hello", cancel, |effect, _| {
            if let Correlated::Steps(range) = effect
                && range.end == 3
            {
                trigger.cancel();
            }
        })
        .await;

    assert!(outcome.surfaced_error().is_none());
    let GenerationOutcome::Cancelled { partial } = outcome else {
        panic!("expected a cancelled generation");
    };
    assert_eq!(partial.as_deref(), Some("abc"));

    assert_eq!(session.steps().len(), 3);
    let assistant: Vec<&ChatMessage> = session
        .history()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant, vec![&ChatMessage::assistant("abc")]);
    assert_eq!(session.partial(), "");
    assert_eq!(session.playback(), PlaybackState::Paused);
    assert_eq!(session.pointer(), Some(2));
}

#[tokio::test]
async fn test_cancel_before_response_is_not_an_error() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(TOKEN_TRACE_DONE, "text/event-stream")
                .set_delay(std::time::Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut session = InspectorSession::from_config(&config);
    let outcome = session
        .send(&client, &config, "hello", cancel, |_, _| {})
        .await;

    assert!(matches!(outcome, GenerationOutcome::Cancelled { partial: None }));
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn test_next_generation_starts_fresh() {
    let (server, client, config) = setup().await;
    Mock::given(method("POST"))
        .and(path("/chat/stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(TOKEN_TRACE_DONE, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let mut session = InspectorSession::from_config(&config);
    for _ in 0..2 {
        let outcome = session
            .send(&client, &config, "again", CancellationToken::new(), |_, _| {})
            .await;
        assert!(matches!(outcome, GenerationOutcome::Completed { .. }));
        assert_eq!(session.steps().len(), 1);
    }
    assert_eq!(session.history().visible().count(), 4);
}
