//! Shared fixtures for the integration tests: a four-agent pipeline config,
//! personas, assessment payloads, provider doubles, and a minimal MCP server
//! speaking Streamable HTTP over a local listener.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use underwrite::application::{LoanApplication, LoanPurpose};
use underwrite::llm::{
    LlmProvider, ProviderError, ProviderReply, ProviderRequest, ScriptedTurn,
};

pub fn application(credit_score: u32, loan_amount: f64, annual_income: f64) -> LoanApplication {
    LoanApplication {
        application_id: "LN-0001".into(),
        applicant_id: "a1b2c3d4-e5f6-4a00-8000-000000000001".into(),
        applicant_name: "Avery Example".into(),
        loan_amount,
        annual_income,
        existing_debt: 1_200.0,
        down_payment: loan_amount * 0.2,
        property_value: Some(loan_amount * 1.25),
        loan_purpose: LoanPurpose::HomePurchase,
        employment_status: "employed".into(),
        credit_score: Some(credit_score),
        additional_data: BTreeMap::new(),
    }
}

pub fn write_personas(dir: &Path) {
    let personas = dir.join("personas");
    std::fs::create_dir_all(&personas).expect("create personas dir");
    for (name, text) in [
        ("intake", "You review loan applications for completeness and routing."),
        ("credit", "You evaluate creditworthiness from bureau data."),
        ("income", "You verify income and compute debt-to-income."),
        ("risk", "You synthesize prior assessments into a lending recommendation."),
    ] {
        std::fs::write(personas.join(format!("{name}.md")), text).expect("write persona");
    }
}

/// Four-agent sequential pipeline. When `credit_server` is given, the credit
/// agent binds that (required) tool server.
pub fn pipeline_yaml(credit_server: Option<&str>) -> String {
    let (server_binding, server_decl) = match credit_server {
        Some(endpoint) => (
            "    tool_servers: [application_verification]\n".to_string(),
            format!(
                "tool_servers:\n  - name: application_verification\n    transport: stream\n    endpoint: {endpoint}\n    required: true\n    startup_grace_seconds: 2\n"
            ),
        ),
        None => (String::new(), "tool_servers: []\n".to_string()),
    };
    format!(
        r#"agents:
  intake:
    display_name: "Intake Agent"
    persona_source: personas/intake.md
    model_id: test-model
    output_schema: intake_assessment
    timeout_seconds: 30
    retry_policy: {{ max_attempts: 2, backoff_multiplier: 1.5 }}
  credit:
    display_name: "Credit Agent"
    persona_source: personas/credit.md
    model_id: test-model
{server_binding}    output_schema: credit_assessment
    timeout_seconds: 30
    retry_policy: {{ max_attempts: 2, backoff_multiplier: 1.5 }}
  income:
    display_name: "Income Agent"
    persona_source: personas/income.md
    model_id: test-model
    output_schema: income_assessment
    timeout_seconds: 30
  risk:
    display_name: "Risk Agent"
    persona_source: personas/risk.md
    model_id: test-model
    output_schema: risk_assessment
    timeout_seconds: 30
    retry_policy: {{ max_attempts: 2, backoff_multiplier: 1.5 }}
{server_decl}patterns:
  loan_processing:
    steps:
      - agent_key: intake
        continue_on_failure: false
      - agent_key: credit
        continue_on_failure: false
        required_predecessors: [intake]
      - agent_key: income
        continue_on_failure: false
        required_predecessors: [intake]
      - agent_key: risk
        continue_on_failure: false
        required_predecessors: [credit, income]
provider:
  kind: llm-capability
"#
    )
}

pub fn intake_ok() -> Value {
    json!({
        "complete": true,
        "missing_fields": [],
        "routing": "standard",
        "confidence": 0.97
    })
}

pub fn credit_ok(score: u64, tier: &str) -> Value {
    json!({
        "credit_score": score,
        "credit_tier": tier,
        "identity_verified": true,
        "utilization": 0.18,
        "confidence": 0.9
    })
}

pub fn income_ok(dti: f64) -> Value {
    json!({
        "annual_income_verified": 180000.0,
        "debt_to_income_ratio": dti,
        "employment_stable": true,
        "confidence": 0.92
    })
}

pub fn risk_approve(amount: f64) -> Value {
    json!({
        "recommendation": "APPROVE",
        "primary_reason": "prime borrower with low debt-to-income",
        "approved_amount": amount,
        "interest_rate": 0.0625,
        "term_months": 360,
        "confidence": 0.95,
        "risk_factors": []
    })
}

pub fn risk_conditional(amount: f64) -> Value {
    json!({
        "recommendation": "CONDITIONAL_APPROVAL",
        "primary_reason": "elevated debt-to-income",
        "approved_amount": amount,
        "interest_rate": 0.071,
        "term_months": 360,
        "conditions": ["two years of tax returns", "reduce revolving balances"],
        "confidence": 0.78,
        "risk_factors": ["dti_38_percent"]
    })
}

pub fn risk_deny() -> Value {
    json!({
        "recommendation": "DENY",
        "primary_reason": "insufficient repayment capacity",
        "supporting_reasons": ["debt-to-income above ceiling", "subprime credit tier"],
        "confidence": 0.88,
        "risk_factors": ["dti_55_percent", "credit_score_560"]
    })
}

/// Provider double that routes scripted turns by the requested output-schema
/// name, so concurrent steps cannot steal each other's replies.
#[derive(Default)]
pub struct SchemaRoutedProvider {
    routes: Mutex<BTreeMap<String, VecDeque<ScriptedTurn>>>,
    calls: Mutex<Vec<String>>,
}

impl SchemaRoutedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, schema: &str, turn: ScriptedTurn) {
        self.routes
            .lock()
            .expect("routes lock")
            .entry(schema.to_string())
            .or_default()
            .push_back(turn);
    }

    pub fn push_final(&self, schema: &str, payload: Value) {
        self.push(schema, ScriptedTurn::Reply(ProviderReply::final_payload(payload)));
    }

    /// Schema names of the calls made, in completion order.
    pub fn called_schemas(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl LlmProvider for SchemaRoutedProvider {
    async fn complete(&self, request: ProviderRequest<'_>) -> Result<ProviderReply, ProviderError> {
        let schema = request.output_schema.name().to_string();
        let turn = self
            .routes
            .lock()
            .map_err(|e| ProviderError::Call(e.to_string()))?
            .get_mut(&schema)
            .and_then(VecDeque::pop_front);
        self.calls
            .lock()
            .map_err(|e| ProviderError::Call(e.to_string()))?
            .push(schema.clone());
        match turn {
            Some(ScriptedTurn::Reply(reply)) => Ok(reply),
            Some(ScriptedTurn::DelayedReply { delay, reply }) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            Some(ScriptedTurn::Fail(message)) => Err(ProviderError::Call(message)),
            None => Err(ProviderError::Call(format!("no scripted turn for {schema}"))),
        }
    }
}

/// Everything the mock MCP server saw, keyed by JSON-RPC method.
pub type RequestLog = Arc<Mutex<Vec<Value>>>;

async fn read_http_request(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_end = pos + 4;
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            let mut body = buf[header_end..].to_vec();
            while body.len() < content_length {
                let m = match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(m) => m,
                };
                body.extend_from_slice(&tmp[..m]);
            }
            let body = String::from_utf8_lossy(&body[..content_length.min(body.len())]).to_string();
            return (headers, body);
        }
    }
    (String::new(), String::new())
}

async fn write_http_response(stream: &mut TcpStream, status: &str, body: &str) {
    let resp = format!(
        "HTTP/1.1 {}\r\nConnection: close\r\nContent-Type: application/json\r\nMCP-Session-Id: sess-test\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

/// Spawns a loop MCP server exposing one `verify_identity` tool. Every
/// request body is appended to the returned log.
pub async fn spawn_mcp_server() -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log_clone = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let (_headers, body) = read_http_request(&mut stream).await;
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            if let Ok(mut log) = log_clone.lock() {
                log.push(request.clone());
            }
            let method = request.get("method").and_then(Value::as_str).unwrap_or("");
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            match method {
                "initialize" => {
                    let body = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"protocolVersion": "2025-06-18"}
                    })
                    .to_string();
                    write_http_response(&mut stream, "200 OK", &body).await;
                }
                "notifications/initialized" => {
                    write_http_response(&mut stream, "202 Accepted", "").await;
                }
                "tools/list" => {
                    let body = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"tools": [{
                            "name": "verify_identity",
                            "description": "Verify an applicant by opaque id",
                            "inputSchema": {"type": "object", "properties": {"applicant_id": {"type": "string"}}}
                        }]}
                    })
                    .to_string();
                    write_http_response(&mut stream, "200 OK", &body).await;
                }
                "tools/call" => {
                    let body = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"content": [{"type": "text", "text": "identity verified"}]}
                    })
                    .to_string();
                    write_http_response(&mut stream, "200 OK", &body).await;
                }
                _ => {
                    write_http_response(&mut stream, "400 Bad Request", "{}").await;
                }
            }
        }
    });
    (addr, log)
}

/// Address of a port nothing is listening on.
pub async fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}/mcp")
}

/// JSON-RPC methods seen by the server, in arrival order.
pub fn methods_seen(log: &RequestLog) -> Vec<String> {
    log.lock()
        .expect("log lock")
        .iter()
        .filter_map(|r| r.get("method").and_then(Value::as_str).map(String::from))
        .collect()
}
