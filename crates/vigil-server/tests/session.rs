//! End-to-end session tests: a controller driving real scripts, with the
//! test playing the transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;
use vigil_sandbox::{GatewayConfig, ScriptGateway, ScriptSource};
use vigil_server::{
    InMemoryScriptStore, Outbound, ScriptStore, SessionConfig, SessionController, SessionState,
};

struct Session {
    controller: SessionController,
    rx: UnboundedReceiver<Outbound>,
    script_id: Uuid,
}

async fn open_on(source: &str, config: SessionConfig, gateway: GatewayConfig) -> Session {
    let store = Arc::new(InMemoryScriptStore::new());
    let stored = store.store(ScriptSource::from(source), None).await;
    let gateway = Arc::new(ScriptGateway::new(gateway));
    let (controller, mut rx) = SessionController::new(store, gateway, config);

    let connected = record(next(&mut rx).await);
    assert_eq!(connected["messageType"], "Connected");
    assert_eq!(connected["sessionId"], controller.session_id().to_string());

    Session {
        controller,
        rx,
        script_id: stored.id,
    }
}

async fn open_with(source: &str, config: SessionConfig) -> Session {
    open_on(source, config, GatewayConfig::default()).await
}

async fn open(source: &str) -> Session {
    open_with(source, SessionConfig::default()).await
}

/// Bind the script and send the start signal.
async fn start(session: &mut Session, signal: &str) {
    session
        .controller
        .handle_frame(&session.script_id.to_string())
        .await;
    assert_eq!(session.controller.state(), SessionState::Ready);
    session.controller.handle_frame(signal).await;
    assert_eq!(session.controller.state(), SessionState::Executing);

    let executing = record(next(&mut session.rx).await);
    assert_eq!(
        executing,
        json!({"messageType": "Executing", "scriptId": session.script_id.to_string()})
    );
}

async fn next(rx: &mut UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no outbound message within 10s")
        .expect("outbound channel closed")
}

async fn frame(rx: &mut UnboundedReceiver<Outbound>) -> String {
    match next(rx).await {
        Outbound::Frame(frame) => frame,
        Outbound::Close => panic!("expected a frame, got close"),
    }
}

fn record(outbound: Outbound) -> Value {
    match outbound {
        Outbound::Frame(frame) => serde_json::from_str(&frame).unwrap(),
        Outbound::Close => panic!("expected a record, got close"),
    }
}

/// The final response followed by the close.
async fn finish(session: &mut Session) -> Value {
    let response = record(next(&mut session.rx).await);
    assert_eq!(next(&mut session.rx).await, Outbound::Close);
    session.controller.wait().await;
    assert_eq!(session.controller.state(), SessionState::Finished);
    response
}

#[tokio::test]
async fn boolean_prompt_round_trip() {
    let mut session = open(
        r#"function audit() {
            return Input.readBoolean("Proceed?") ? AuditResult.success() : AuditResult.failure("declined");
        }"#,
    )
    .await;
    start(&mut session, "start").await;

    assert_eq!(frame(&mut session.rx).await, "readBoolean:Proceed?");
    session.controller.handle_frame("TRUE").await;

    assert_eq!(
        finish(&mut session).await,
        json!({"messageType": "AuditResultResponse", "result": {"type": "Successful"}})
    );
}

#[tokio::test]
async fn fields_that_do_not_parse_are_left_out() {
    let mut session = open(
        r#"function audit() {
            const answers = Input.readFields([
                { type: "Boolean", name: "field1", description: "Active?" },
                { type: "Number", name: "field2", description: "Balance" },
            ], "Details");
            if (answers.size !== 1) return AuditResult.failure("size " + answers.size);
            if (answers.get("field1") !== true) return AuditResult.failure("field1");
            if (answers.get("field2") !== null) return AuditResult.failure("field2");
            return AuditResult.success();
        }"#,
    )
    .await;
    start(&mut session, "start").await;

    assert_eq!(frame(&mut session.rx).await, "readFields:2:Details");
    assert_eq!(frame(&mut session.rx).await, "field:BOOLEAN:field1:Active?");
    assert_eq!(frame(&mut session.rx).await, "field:NUMBER:field2:Balance");
    session.controller.handle_frame("true").await;
    session.controller.handle_frame("abc").await;

    assert_eq!(finish(&mut session).await["result"]["type"], "Successful");
}

#[tokio::test]
async fn string_fields_pass_through_unchanged() {
    let mut session = open(
        r#"function audit() {
            const answers = Input.readFields([
                { type: "Boolean", name: "field1", description: "Enabled" },
                { type: "String", name: "field2", description: "Label" },
            ], "Settings");
            if (answers.size !== 2) return AuditResult.failure("size " + answers.size);
            if (answers.get("field1") !== true) return AuditResult.failure("field1");
            if (answers.get("field2") !== "hello") return AuditResult.failure("field2 " + answers.get("field2"));
            return AuditResult.success();
        }"#,
    )
    .await;
    start(&mut session, "start").await;

    assert_eq!(frame(&mut session.rx).await, "readFields:2:Settings");
    assert_eq!(frame(&mut session.rx).await, "field:BOOLEAN:field1:Enabled");
    assert_eq!(frame(&mut session.rx).await, "field:STRING:field2:Label");
    session.controller.handle_frame("true").await;
    session.controller.handle_frame("hello").await;

    assert_eq!(
        finish(&mut session).await,
        json!({"messageType": "AuditResultResponse", "result": {"type": "Successful"}})
    );
}

#[tokio::test]
async fn slow_answers_outlast_the_execution_budget() {
    let gateway = GatewayConfig {
        timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut session = open_on(
        r#"function audit() {
            return Input.readBoolean("Still there?") ? AuditResult.success() : AuditResult.failure("no");
        }"#,
        SessionConfig::default(),
        gateway,
    )
    .await;
    start(&mut session, "start").await;
    assert_eq!(frame(&mut session.rx).await, "readBoolean:Still there?");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.controller.handle_frame("true").await;

    assert_eq!(
        finish(&mut session).await,
        json!({"messageType": "AuditResultResponse", "result": {"type": "Successful"}})
    );
}

#[tokio::test]
async fn disconnect_while_prompting_ends_without_response() {
    let mut session = open(
        r#"function audit() {
            try { Input.readString("Name?"); } catch (e) { return AuditResult.failure("caught"); }
            return AuditResult.success();
        }"#,
    )
    .await;
    start(&mut session, "start").await;
    assert_eq!(frame(&mut session.rx).await, "readString:Name?");

    session.controller.handle_close();
    assert_eq!(session.controller.state(), SessionState::Finished);
    session.controller.wait().await;

    assert!(session.rx.try_recv().is_err(), "no response after disconnect");
    assert_eq!(session.controller.state(), SessionState::Finished);
}

#[tokio::test]
async fn unknown_script_ids_are_reported_and_closed() {
    for id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
        let mut session = open("function audit() { return AuditResult.success(); }").await;
        session.controller.handle_frame(&id).await;

        assert_eq!(
            record(next(&mut session.rx).await),
            json!({"messageType": "NotFound", "scriptId": id})
        );
        assert_eq!(next(&mut session.rx).await, Outbound::Close);
        assert_eq!(session.controller.state(), SessionState::Finished);
    }
}

#[tokio::test]
async fn answers_without_a_prompt_are_dropped() {
    let mut session = open(
        r#"function audit() {
            return Input.readString("Token?") === "abc"
                ? AuditResult.success()
                : AuditResult.failure("wrong answer");
        }"#,
    )
    .await;
    session
        .controller
        .handle_frame(&session.script_id.to_string())
        .await;

    // Not a start signal: ignored while ready.
    session.controller.handle_frame("abc").await;
    session.controller.handle_frame("start:{oops").await;
    assert_eq!(session.controller.state(), SessionState::Ready);
    assert!(session.rx.try_recv().is_err());

    session.controller.handle_frame("start").await;
    assert_eq!(record(next(&mut session.rx).await)["messageType"], "Executing");
    assert_eq!(frame(&mut session.rx).await, "readString:Token?");

    session.controller.handle_frame("abc").await;
    assert_eq!(session.controller.outstanding_answers(), 0);
    session.controller.handle_frame("unsolicited").await;
    assert_eq!(session.controller.outstanding_answers(), 0);

    assert_eq!(finish(&mut session).await["result"]["type"], "Successful");
}

#[tokio::test]
async fn unanswered_prompt_times_out() {
    let config = SessionConfig {
        prompt_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let mut session = open_with(
        r#"function audit() {
            try { Input.button("Continue"); } catch (e) { return AuditResult.success(); }
            return AuditResult.success();
        }"#,
        config,
    )
    .await;
    start(&mut session, "start").await;
    assert_eq!(frame(&mut session.rx).await, "button:Continue");

    let response = finish(&mut session).await;
    assert_eq!(response["messageType"], "ErrorResponse");
    assert_eq!(response["code"], "PROMPT_TIMEOUT");
}

#[tokio::test]
async fn start_signal_carries_the_payload() {
    let mut session = open(
        r#"function audit(payload) {
            return payload.threshold === 5
                ? AuditResult.success()
                : AuditResult.aborted("threshold " + payload.threshold);
        }"#,
    )
    .await;
    start(&mut session, r#"start:{"threshold": 5}"#).await;
    assert_eq!(finish(&mut session).await["result"]["type"], "Successful");
}

#[tokio::test]
async fn evaluation_errors_become_error_responses() {
    let mut session = open(r#"function audit() { return "nope"; }"#).await;
    start(&mut session, "start").await;

    let response = finish(&mut session).await;
    assert_eq!(response["messageType"], "ErrorResponse");
    assert_eq!(response["code"], "INVALID_RETURN_VALUE");
    assert!(response["message"].as_str().unwrap().contains("string"));
}

#[tokio::test]
async fn malformed_field_descriptors_send_no_prompt() {
    let mut session = open(
        r#"function audit() {
            return Input.readFields([{ type: "Color", name: "x", description: "y" }], "bad") === null
                ? AuditResult.success()
                : AuditResult.failure("prompted");
        }"#,
    )
    .await;
    start(&mut session, "start").await;

    let response = finish(&mut session).await;
    assert_eq!(response["messageType"], "AuditResultResponse");
    assert_eq!(response["result"]["type"], "Successful");
}

#[tokio::test]
async fn renders_arrive_in_order() {
    let mut session = open(
        r##"function audit() {
            Output.renderText("checking");
            Output.renderHtml("<b>balance</b>");
            Output.renderMarkdown("# done");
            return AuditResult.failure("low balance");
        }"##,
    )
    .await;
    start(&mut session, "start").await;

    assert_eq!(frame(&mut session.rx).await, "renderText:checking");
    assert_eq!(frame(&mut session.rx).await, "renderHtml:<b>balance</b>");
    assert_eq!(frame(&mut session.rx).await, "renderMarkdown:# done");
    assert_eq!(
        finish(&mut session).await,
        json!({"messageType": "AuditResultResponse", "result": {"type": "Failed", "message": "low balance"}})
    );
}

#[tokio::test]
async fn finished_sessions_ignore_further_frames() {
    let mut session = open("function audit() { return AuditResult.success(); }").await;
    start(&mut session, "start").await;
    finish(&mut session).await;

    session.controller.handle_frame("start").await;
    session.controller.handle_frame(&session.script_id.to_string()).await;
    assert_eq!(session.controller.state(), SessionState::Finished);
    assert!(session.rx.try_recv().is_err());
}
