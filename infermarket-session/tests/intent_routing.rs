//! Integration tests for intent routing through a live session.

use std::sync::{Arc, Mutex};

use infermarket_session::intent::{ImageSize, DEFAULT_IMAGE_SIZE, DEFAULT_STEPS};
use infermarket_session::{OperationKind, PromptOptions, RequestBody, StructuredResult};
use infermarket_test_fixtures::{Harness, PLACEHOLDER_PNG};

fn capture(h: &Harness) -> Arc<Mutex<Vec<StructuredResult>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.engine.on_structured_result(move |result| sink.lock().unwrap().push(result));
    seen
}

#[tokio::test]
async fn test_image_prompt_with_parameters() {
    let h = Harness::new();
    let seen = capture(&h);
    let session = h.start().await.unwrap();

    let reply = h
        .engine
        .send_prompt(&session, "draw a red fox in 768x768 with 30 steps", PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.kind, OperationKind::ImageGeneration);
    let image = reply.image.unwrap();
    assert_eq!(image.image_base64, PLACEHOLDER_PNG);
    assert_eq!(image.size, ImageSize::new(768, 768));
    assert_eq!(image.steps, 30);

    let requests = h.host.requests();
    assert_eq!(
        requests[0].body,
        RequestBody::ImageGeneration {
            prompt: "a red fox".into(),
            size: ImageSize::new(768, 768),
            steps: 30,
        }
    );

    session.wait_idle().await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].clean_prompt, "a red fox");
    assert_eq!(seen[0].session_id, session.id());
    assert_eq!(seen[0].message_id, reply.message_id);
    assert_eq!(seen[0].parameters.steps, Some(30));
}

#[tokio::test]
async fn test_image_prompt_defaults() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    let reply = h
        .engine
        .send_prompt(&session, "generate an image of a lighthouse", PromptOptions::default())
        .await
        .unwrap();
    let image = reply.image.unwrap();
    assert_eq!(image.size, DEFAULT_IMAGE_SIZE);
    assert_eq!(image.steps, DEFAULT_STEPS);
    assert_eq!(reply.tokens, 50);
}

#[tokio::test]
async fn test_transcript_routes_on_last_user_turn() {
    let h = Harness::new();
    let seen = capture(&h);
    let session = h.start().await.unwrap();

    let transcript = "User: draw a cat\nAssistant: Here it is.\nUser: thanks, now tell me a joke";
    let reply = h
        .engine
        .send_prompt(&session, transcript, PromptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.kind, OperationKind::TextStream);
    assert!(reply.image.is_none());

    // Text prompts go to the host verbatim.
    match &h.host.requests()[0].body {
        RequestBody::Inference { prompt, .. } => assert_eq!(prompt, transcript),
        other => panic!("expected inference request, got {:?}", other),
    }
    session.wait_idle().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_routing_can_be_disabled() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    let options = PromptOptions {
        intent_routing: false,
        max_tokens: Some(64),
        temperature: Some(0.2),
        ..PromptOptions::default()
    };
    let reply = h
        .engine
        .send_prompt(&session, "draw a cat", options)
        .await
        .unwrap();
    assert_eq!(reply.kind, OperationKind::TextStream);

    assert_eq!(
        h.host.requests()[0].body,
        RequestBody::Inference {
            prompt: "draw a cat".into(),
            max_tokens: Some(64),
            temperature: Some(0.2),
        }
    );
}

#[tokio::test]
async fn test_bare_trigger_stays_text() {
    let h = Harness::new();
    let session = h.start().await.unwrap();

    let queued = h.engine.enqueue_prompt(&session, "draw", PromptOptions::default()).unwrap();
    assert_eq!(queued.kind(), OperationKind::TextStream);
    let reply = queued.dispatch().await.unwrap().collect_reply().await.unwrap();
    assert_eq!(reply.text, "Hello, world");
}
