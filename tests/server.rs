//! HTTP API tests: the server runs in the background on a free port with a
//! scripted completion client, and requests go through `reqwest`.

mod common;

use base64::Engine as _;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use math_mentor::config::Config;
use math_mentor::server::run_server_with_orchestrator;

use common::{evaluation, orchestrator, test_config, ScriptedClient, PNG};

const TWO_PLUS_TWO: &str = r#"{"problem_text":"What is 2+2?","topic":"Arithmetic","variables":[],"constraints":[],"needs_clarification":false}"#;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(format!("{}/health", base)).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

/// Start a server over `client`; `tweak` adjusts the config first.
async fn start(client: ScriptedClient, tweak: impl FnOnce(&mut Config)) -> (TempDir, String) {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let mut cfg = test_config(&tmp);
    cfg.server.bind = format!("127.0.0.1:{}", port);
    tweak(&mut cfg);

    let orchestrator = Arc::new(orchestrator(&cfg, Arc::new(client)));
    tokio::spawn(async move {
        run_server_with_orchestrator(&cfg, orchestrator).await.ok();
    });

    let base = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base).await;
    (tmp, base)
}

async fn create_session(http: &reqwest::Client, base: &str) -> String {
    let resp = http.post(format!("{}/sessions", base)).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn solved_two_plus_two() -> ScriptedClient {
    ScriptedClient::default()
        .text("guardrail", "SAFE_MATH")
        .text("parser", TWO_PLUS_TWO)
        .text("solver", "### Final Answer\n**4**")
        .text("evaluator", &evaluation(96))
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ask_returns_solution_and_records_turns() {
    let (_tmp, base) = start(solved_two_plus_two(), |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    let resp = http
        .post(format!("{}/sessions/{}/ask", base, id))
        .json(&json!({"text": "What is 2+2?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["status"], "done");
    assert_eq!(outcome["confidence"], 96);
    assert_eq!(outcome["turn"], 1);
    assert_eq!(outcome["solution"], "### Final Answer\n**4**");

    let session: Value = http
        .get(format!("{}/sessions/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["state"], "idle");
    let turns = session["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[1]["feedback_eligible"], true);
    assert_eq!(turns[1]["has_source_image"], false);
}

#[tokio::test]
async fn test_image_confirm_with_edit_serves_source_image() {
    let client = ScriptedClient::default()
        .text("vision", "Solve 2x = 6")
        .text("guardrail", "SAFE_MATH")
        .text(
            "parser",
            r#"{"problem_text":"Solve 2x = 8","topic":"Algebra","variables":["x"],"constraints":[],"needs_clarification":false}"#,
        )
        .text("solver", "### Final Answer\n**x = 4**")
        .text("evaluator", &evaluation(90));
    let (_tmp, base) = start(client, |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    let resp = http
        .post(format!("{}/sessions/{}/image", base, id))
        .json(&json!({"image_base64": encode(PNG)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["extracted_text"], "Solve 2x = 6");

    // Typed questions wait until the extraction is settled.
    let resp = http
        .post(format!("{}/sessions/{}/ask", base, id))
        .json(&json!({"text": "What is 2+2?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "awaiting_confirmation");

    let resp = http
        .post(format!("{}/sessions/{}/confirm", base, id))
        .json(&json!({"text": "Solve 2x = 8"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["status"], "done");
    assert_eq!(outcome["problem"]["problem_text"], "Solve 2x = 8");

    let session: Value = http
        .get(format!("{}/sessions/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["turns"][0]["content"], "Analyze this image.");
    assert_eq!(session["turns"][0]["has_source_image"], true);

    let resp = http
        .get(format!("{}/sessions/{}/turns/0/image", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), PNG);

    let resp = http
        .get(format!("{}/sessions/{}/turns/1/image", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_blank_confirmation_is_rejected_and_keeps_extraction() {
    let client = ScriptedClient::default().text("vision", "Solve 3x = 9");
    let (_tmp, base) = start(client, |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    http.post(format!("{}/sessions/{}/image", base, id))
        .json(&json!({"image_base64": encode(PNG)}))
        .send()
        .await
        .unwrap();

    let resp = http
        .post(format!("{}/sessions/{}/confirm", base, id))
        .json(&json!({"text": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let session: Value = http
        .get(format!("{}/sessions/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["state"], "awaiting_hitl_confirmation");
    assert_eq!(session["pending"]["kind"], "image");
}

#[tokio::test]
async fn test_feedback_accepts_once() {
    let (_tmp, base) = start(solved_two_plus_two(), |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    http.post(format!("{}/sessions/{}/ask", base, id))
        .json(&json!({"text": "What is 2+2?"}))
        .send()
        .await
        .unwrap();

    let feedback = |turn: usize, verdict: &str| {
        http.post(format!("{}/sessions/{}/feedback", base, id))
            .json(&json!({"turn": turn, "feedback": verdict}))
            .send()
    };

    assert_eq!(feedback(1, "accurate").await.unwrap().status(), 204);

    let resp = feedback(1, "accurate").await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    assert_eq!(feedback(1, "inaccurate").await.unwrap().status(), 204);
    assert_eq!(feedback(7, "inaccurate").await.unwrap().status(), 404);
}

#[tokio::test]
async fn test_cancel_without_pending_conflicts() {
    let (_tmp, base) = start(ScriptedClient::default(), |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    let resp = http
        .post(format!("{}/sessions/{}/cancel", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_pending_extraction");
}

#[tokio::test]
async fn test_large_image_upload_reaches_extraction() {
    let client = ScriptedClient::default().text("vision", "Find the area of the triangle");
    let (_tmp, base) = start(client, |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    // A 3 MiB photo is about 4 MiB once base64-encoded.
    let mut photo = PNG.to_vec();
    photo.resize(3 * 1024 * 1024, 0);

    let resp = http
        .post(format!("{}/sessions/{}/image", base, id))
        .json(&json!({"image_base64": encode(&photo)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["extracted_text"], "Find the area of the triangle");
}

#[tokio::test]
async fn test_body_limit_is_configurable() {
    let (_tmp, base) = start(ScriptedClient::default(), |cfg| cfg.server.max_body_bytes = 4096).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;

    let mut photo = PNG.to_vec();
    photo.resize(16 * 1024, 0);
    let resp = http
        .post(format!("{}/sessions/{}/image", base, id))
        .json(&json!({"image_base64": encode(&photo)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);
}

#[tokio::test]
async fn test_delete_session() {
    let (_tmp, base) = start(ScriptedClient::default(), |_| {}).await;
    let http = reqwest::Client::new();
    let id = create_session(&http, &base).await;
    let url = format!("{}/sessions/{}", base, id);

    assert_eq!(http.delete(&url).send().await.unwrap().status(), 204);
    assert_eq!(http.get(&url).send().await.unwrap().status(), 404);
    assert_eq!(http.delete(&url).send().await.unwrap().status(), 404);
}

#[tokio::test]
async fn test_idle_sessions_expire() {
    let (_tmp, base) = start(ScriptedClient::default(), |cfg| cfg.server.session_ttl_secs = 1).await;
    let http = reqwest::Client::new();
    let idle = create_session(&http, &base).await;
    let url = format!("{}/sessions/{}", base, idle);
    assert_eq!(http.get(&url).send().await.unwrap().status(), 200);

    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;

    let fresh = create_session(&http, &base).await;
    assert_eq!(http.get(&url).send().await.unwrap().status(), 404);
    assert_eq!(
        http.get(format!("{}/sessions/{}", base, fresh))
            .send()
            .await
            .unwrap()
            .status(),
        200
    );
}
