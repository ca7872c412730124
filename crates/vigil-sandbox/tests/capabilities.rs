//! Capability tests through the full evaluation pipeline.
//!
//! These run real scripts against stub transports and check what the host
//! observed, not just what the script returned.

use std::sync::Arc;

use parking_lot::Mutex;
use vigil_error::{IpfsError, TransportError};
use vigil_sandbox::audit::{AuditEntry, AuditLogger, AuditOutcome, EvaluationMode};
use vigil_sandbox::{
    AuditResult, EvaluationError, EvaluationOptions, ExecutionContext, GatewayConfig,
    HttpRequest, HttpTransport, IpfsFetcher, RawHttpResponse, ScriptGateway, ScriptSource,
    TextFile,
};

/// Records requests and answers with an echo of the method.
#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<HttpRequest>>,
}

impl HttpTransport for RecordingTransport {
    fn send(&self, request: &HttpRequest) -> Result<RawHttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        if request.url.contains("down") {
            return Err(TransportError::Request(
                "connection refused by https://10.0.0.5:8545/secret".into(),
            ));
        }
        Ok(RawHttpResponse {
            status: 201,
            headers: vec![("X-Method".into(), request.method.clone())],
            body: request.body.clone().unwrap_or_default(),
        })
    }
}

/// Serves one directory with fixed files.
struct FixedIpfs;

impl IpfsFetcher for FixedIpfs {
    fn fetch_text_file_from_directory(
        &self,
        directory: &str,
        file_name: &str,
    ) -> Result<TextFile, IpfsError> {
        match (directory, file_name) {
            ("QmAudit", "config.json") => Ok(TextFile {
                name: file_name.into(),
                content: r#"{"minBalance": 100}"#.into(),
            }),
            ("QmAudit", "broken.json") => Err(IpfsError::Http { status: 502 }),
            _ => Err(IpfsError::Http { status: 404 }),
        }
    }
}

#[derive(Default)]
struct CollectingLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

#[async_trait::async_trait]
impl AuditLogger for CollectingLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.entries.lock().push(entry.clone());
    }
}

fn source(text: &str) -> ScriptSource {
    ScriptSource::from(text)
}

#[tokio::test]
async fn post_and_request_send_what_the_script_built() {
    let transport = Arc::new(RecordingTransport::default());
    let gateway =
        ScriptGateway::new(GatewayConfig::default()).with_http_transport(transport.clone());

    let script = r#"
        function audit() {
            const a = HttpClient.post("https://api.example/submit", "{\"x\":1}", { "Content-Type": "application/json" });
            const b = HttpClient.request("https://api.example/item", "delete", undefined, { "X-Trace": "t1", "X-Num": 5 });
            if (a.statusCode !== 201 || a.body !== "{\"x\":1}") return AuditResult.failure("post");
            if (b.headers.get("x-method").get(0) !== "DELETE") return AuditResult.failure("request");
            return AuditResult.success();
        }
    "#;
    let result = gateway
        .evaluate(&source(script), ExecutionContext::noop())
        .await
        .unwrap();
    assert_eq!(result, AuditResult::Successful);

    let requests = transport.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].body.as_deref(), Some(r#"{"x":1}"#));
    assert_eq!(
        requests[0].headers,
        vec![("Content-Type".to_string(), "application/json".to_string())]
    );
    assert_eq!(requests[1].method, "DELETE");
    assert_eq!(requests[1].body, None);
    // Non-string header values are dropped.
    assert_eq!(
        requests[1].headers,
        vec![("X-Trace".to_string(), "t1".to_string())]
    );
}

#[tokio::test]
async fn transport_failures_are_catchable_and_redacted() {
    let gateway = ScriptGateway::new(GatewayConfig::default())
        .with_http_transport(Arc::new(RecordingTransport::default()));
    let script = r#"
        function audit() {
            try {
                HttpClient.get("https://down.example");
            } catch (e) {
                return AuditResult.aborted(e.message);
            }
            return AuditResult.success();
        }
    "#;
    match gateway
        .evaluate(&source(script), ExecutionContext::noop())
        .await
        .unwrap()
    {
        AuditResult::Aborted { message } => {
            assert!(message.starts_with("HttpClient.get() failed"), "{message}");
            assert!(!message.contains("10.0.0.5"), "{message}");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn directory_based_ipfs_reads_files() {
    let gateway =
        ScriptGateway::new(GatewayConfig::default()).with_ipfs_fetcher(Arc::new(FixedIpfs));
    let script = r#"
        function audit() {
            const config = JSON.parse(Ipfs.getFile("config.json"));
            if (config.minBalance !== 100) return AuditResult.failure("content");
            if (Ipfs.getFile("absent.txt") !== null) return AuditResult.failure("absent");
            try {
                Ipfs.getFile("broken.json");
                return AuditResult.failure("no error");
            } catch (e) {
                return AuditResult.success();
            }
        }
    "#;
    let options = EvaluationOptions {
        ipfs_directory: Some("QmAudit".into()),
        ..Default::default()
    };
    let result = gateway
        .evaluate_with_options(&source(script), ExecutionContext::noop(), options)
        .await
        .unwrap();
    assert_eq!(result, AuditResult::Successful);
}

#[tokio::test]
async fn ipfs_path_traversal_is_a_contract_violation() {
    let gateway =
        ScriptGateway::new(GatewayConfig::default()).with_ipfs_fetcher(Arc::new(FixedIpfs));
    let script = r#"function audit() { Ipfs.getFile("../etc/passwd"); return AuditResult.success(); }"#;
    let options = EvaluationOptions {
        ipfs_directory: Some("QmAudit".into()),
        ..Default::default()
    };
    let err = gateway
        .evaluate_with_options(&source(script), ExecutionContext::noop(), options)
        .await
        .unwrap_err();
    match &err {
        EvaluationError::InvalidInputValue(invalid) => {
            assert_eq!(invalid.call_site, "Ipfs.getFile()");
            assert_eq!(invalid.index, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let structured = err.to_structured_error();
    assert_eq!(structured["code"], "INVALID_INPUT_VALUE");
    assert_eq!(structured["argumentIndex"], 0);
}

#[tokio::test]
async fn audit_log_records_calls_and_outcome() {
    let logger = Arc::new(CollectingLogger::default());
    let gateway = ScriptGateway::new(GatewayConfig::default())
        .with_http_transport(Arc::new(RecordingTransport::default()))
        .with_audit_logger(logger.clone());

    let script = r#"
        function audit() {
            HttpClient.get("https://a.example/?token=abc");
            try { HttpClient.get("https://down.example"); } catch (e) {}
            return AuditResult.failure("done");
        }
    "#;
    gateway
        .evaluate(&source(script), ExecutionContext::noop())
        .await
        .unwrap();

    let entries = logger.entries.lock();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.mode, EvaluationMode::Batch);
    assert_eq!(entry.http_calls.len(), 2);
    assert!(entry.http_calls[0].success);
    assert_eq!(entry.http_calls[0].status, Some(201));
    assert!(!entry.http_calls[1].success);
    assert_ne!(entry.http_calls[0].url_hash, "https://a.example/?token=abc");
    assert_eq!(
        entry.outcome,
        AuditOutcome::Completed {
            result: "failed".into()
        }
    );
}

#[tokio::test]
async fn evaluations_do_not_share_state() {
    let gateway = ScriptGateway::new(GatewayConfig::default());
    let first = r#"
        var seen = 1;
        function audit() { globalThis.leak = "x"; return AuditResult.success(); }
    "#;
    let second = r#"
        function audit() {
            return typeof leak === "undefined" && typeof seen === "undefined"
                ? AuditResult.success()
                : AuditResult.failure("leaked");
        }
    "#;
    for script in [first, second] {
        assert_eq!(
            gateway
                .evaluate(&source(script), ExecutionContext::noop())
                .await
                .unwrap(),
            AuditResult::Successful
        );
    }
}

#[tokio::test]
async fn console_output_does_not_disturb_the_result() {
    let gateway = ScriptGateway::new(GatewayConfig::default());
    let script = r#"
        function audit(payload) {
            console.log("checking", { block: payload.block }, [1, 2]);
            console.warn(Converters.arrayToList([1]));
            return AuditResult.success();
        }
    "#;
    let options = EvaluationOptions {
        payload: Some(serde_json::json!({"block": 19})),
        ..Default::default()
    };
    assert_eq!(
        gateway
            .evaluate_with_options(&source(script), ExecutionContext::noop(), options)
            .await
            .unwrap(),
        AuditResult::Successful
    );
}
