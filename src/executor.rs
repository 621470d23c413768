//! Leaf node executors.
//!
//! Each handler is a function of `(props, scoped blackboard, context)`
//! returning a [`StepResult`]. Failures are values, never errors propagated
//! to the worker loop; references in props are resolved against the scoped
//! blackboard before any side effect happens.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::definition::{
    FailForProps, HitEndpointProps, KvGetProps, KvSetProps, Node, Patch, PropValue, SendEmailProps,
    SleepProps,
};
use crate::store::Store;

/// Total request budget for the HTTP executor.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of executing one leaf.
#[derive(Clone, Debug)]
pub enum StepResult {
    Success {
        patches: Vec<Patch>,
    },
    /// The step is done as a scheduling commitment; the instance becomes
    /// claimable again at `next_run_at`.
    Wait {
        next_run_at: DateTime<Utc>,
        patches: Vec<Patch>,
    },
    /// Non-terminal failure; the scheduler applies the retry policy.
    Fail {
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

/// Collaborators handed to executors for one step.
pub struct ExecutionContext<'a> {
    pub store: &'a Store,
    pub http: &'a reqwest::Client,
    /// Attempt number for this step, as incremented by the scheduler.
    pub attempt: i32,
}

fn fail(error: String) -> StepResult {
    StepResult::Fail {
        error,
        retry_at: None,
    }
}

fn resolve_text(prop: &PropValue, blackboard: &Value) -> String {
    match prop.resolve(blackboard) {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Execute a leaf against its scoped blackboard.
pub async fn execute(node: &Node, scoped_blackboard: &Value, ctx: &ExecutionContext<'_>) -> StepResult {
    match node {
        Node::Sequence { .. } | Node::ForEach { .. } => fail(format!(
            "node {} is a {} and cannot be executed as a step",
            node.id(),
            node.kind_str()
        )),
        Node::HitEndpoint { props, .. } => hit_endpoint(props, scoped_blackboard, ctx.http).await,
        Node::Sleep { props, .. } => sleep(props),
        Node::SendEmail { props, .. } => send_email(props, scoped_blackboard),
        Node::KvGet { props, .. } => kv_get(props, scoped_blackboard, ctx).await,
        Node::KvSet { props, .. } => kv_set(props, scoped_blackboard, ctx).await,
        Node::FailFor { props, .. } => fail_for(props, ctx.attempt),
        Node::Unknown { id, kind, .. } => {
            fail(format!("unknown node type {kind} for node {id}"))
        }
    }
}

async fn hit_endpoint(
    props: &HitEndpointProps,
    blackboard: &Value,
    http: &reqwest::Client,
) -> StepResult {
    let url = match props.url.resolve(blackboard) {
        Value::String(url) => url,
        other => return fail(format!("endpoint url must resolve to a string, got {other}")),
    };
    let method_text = props.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = match reqwest::Method::from_bytes(method_text.as_bytes()) {
        Ok(method) => method,
        Err(_) => return fail(format!("invalid http method: {method_text}")),
    };

    let mut request = http.request(method, &url).timeout(HTTP_TIMEOUT);
    if let Some(headers) = &props.headers
        && let Value::Object(map) = headers.resolve(blackboard)
    {
        for (name, value) in &map {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            request = request.header(name.as_str(), text);
        }
    }
    if let Some(body) = &props.body {
        let body = body.resolve(blackboard);
        if !body.is_null() {
            request = request.json(&body);
        }
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return fail(format!("request to {url} failed: {err}")),
    };

    // Any HTTP response, 2xx or not, is a successful step; callers branch on
    // the recorded status themselves.
    let status = response.status();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    let text = match response.text().await {
        Ok(text) => text,
        Err(err) => return fail(format!("reading response from {url} failed: {err}")),
    };
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    StepResult::Success {
        patches: vec![Patch::Set {
            path: props.assign_to.clone(),
            value: json!({
                "status": status.as_u16(),
                "statusText": status.canonical_reason().unwrap_or_default(),
                "headers": headers,
                "body": body,
            }),
        }],
    }
}

fn sleep(props: &SleepProps) -> StepResult {
    let millis = (props.seconds * 1000.0).round() as i64;
    StepResult::Wait {
        next_run_at: Utc::now() + chrono::Duration::milliseconds(millis),
        patches: Vec::new(),
    }
}

fn send_email(props: &SendEmailProps, blackboard: &Value) -> StepResult {
    let to = resolve_text(&props.to, blackboard);
    let subject = resolve_text(&props.subject, blackboard);
    let body = resolve_text(&props.body, blackboard);
    info!(
        target: "belay::email",
        to = %to,
        subject = %subject,
        body = %body,
        "email dispatched"
    );
    StepResult::Success {
        patches: Vec::new(),
    }
}

async fn kv_get(props: &KvGetProps, blackboard: &Value, ctx: &ExecutionContext<'_>) -> StepResult {
    let store_name = resolve_text(&props.store, blackboard);
    let key = resolve_text(&props.key, blackboard);
    match ctx.store.kv_get(&store_name, &key).await {
        Ok(value) => StepResult::Success {
            patches: vec![Patch::Set {
                path: props.assign_to.clone(),
                value: value.unwrap_or(Value::Null),
            }],
        },
        Err(err) => fail(format!("kv get {store_name}/{key} failed: {err}")),
    }
}

async fn kv_set(props: &KvSetProps, blackboard: &Value, ctx: &ExecutionContext<'_>) -> StepResult {
    let store_name = resolve_text(&props.store, blackboard);
    let key = resolve_text(&props.key, blackboard);
    let value = props.value.resolve(blackboard);
    match ctx.store.kv_set(&store_name, &key, &value).await {
        Ok(()) => StepResult::Success {
            patches: Vec::new(),
        },
        Err(err) => fail(format!("kv set {store_name}/{key} failed: {err}")),
    }
}

fn fail_for(props: &FailForProps, attempt: i32) -> StepResult {
    if attempt <= props.times {
        fail(format!(
            "synthetic failure on attempt {attempt} of {}",
            props.times
        ))
    } else {
        StepResult::Success {
            patches: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fail_for_fails_through_the_configured_attempts() {
        let props = FailForProps { times: 2 };
        assert!(matches!(fail_for(&props, 1), StepResult::Fail { .. }));
        assert!(matches!(fail_for(&props, 2), StepResult::Fail { .. }));
        assert!(matches!(fail_for(&props, 3), StepResult::Success { .. }));
    }

    #[test]
    fn fail_for_zero_succeeds_immediately() {
        let props = FailForProps { times: 0 };
        assert!(matches!(fail_for(&props, 1), StepResult::Success { .. }));
    }

    #[test]
    fn sleep_schedules_a_future_wakeup() {
        let before = Utc::now();
        let StepResult::Wait {
            next_run_at,
            patches,
        } = sleep(&SleepProps { seconds: 2.0 })
        else {
            panic!("expected wait result");
        };
        assert!(patches.is_empty());
        let offset_ms = (next_run_at - before).num_milliseconds();
        assert!((1900..=2500).contains(&offset_ms), "offset was {offset_ms}ms");
    }

    #[test]
    fn zero_second_sleep_is_due_immediately() {
        let before = Utc::now();
        let StepResult::Wait { next_run_at, .. } = sleep(&SleepProps { seconds: 0.0 }) else {
            panic!("expected wait result");
        };
        assert!((next_run_at - before).num_milliseconds() < 500);
    }

    #[test]
    fn send_email_resolves_references_and_succeeds() {
        let props = SendEmailProps {
            to: PropValue::literal("u@x"),
            subject: PropValue::reference("$.r.title"),
            body: PropValue::reference("$.missing"),
        };
        let blackboard = json!({ "r": { "title": "hello" } });
        let StepResult::Success { patches } = send_email(&props, &blackboard) else {
            panic!("expected success");
        };
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn hit_endpoint_rejects_non_string_urls() {
        let props = HitEndpointProps {
            url: PropValue::literal(42),
            method: None,
            headers: None,
            body: None,
            assign_to: "$.r".to_string(),
        };
        let client = reqwest::Client::new();
        let StepResult::Fail { error, .. } = hit_endpoint(&props, &json!({}), &client).await else {
            panic!("expected failure");
        };
        assert!(error.contains("must resolve to a string"), "{error}");
    }

    #[tokio::test]
    async fn hit_endpoint_turns_network_errors_into_failures() {
        // Port 1 on loopback refuses connections immediately.
        let props = HitEndpointProps {
            url: PropValue::literal("http://127.0.0.1:1/unreachable"),
            method: None,
            headers: None,
            body: None,
            assign_to: "$.r".to_string(),
        };
        let client = reqwest::Client::new();
        let StepResult::Fail { error, retry_at } = hit_endpoint(&props, &json!({}), &client).await
        else {
            panic!("expected failure");
        };
        assert!(error.contains("failed"), "{error}");
        assert!(retry_at.is_none());
    }

    #[tokio::test]
    async fn hit_endpoint_records_non_2xx_responses_as_success() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let body = r#"{"error":"missing"}"#;
            let response = format!(
                "HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });

        let props = HitEndpointProps {
            url: PropValue::literal(format!("http://{addr}/missing")),
            method: None,
            headers: None,
            body: None,
            assign_to: "$.r".to_string(),
        };
        let client = reqwest::Client::new();
        let StepResult::Success { patches } = hit_endpoint(&props, &json!({}), &client).await
        else {
            panic!("non-2xx response must still succeed");
        };
        let [Patch::Set { path, value }] = patches.as_slice() else {
            panic!("expected a single set patch");
        };
        assert_eq!(path, "$.r");
        assert_eq!(value.get("status"), Some(&json!(404)));
        assert_eq!(value.get("statusText"), Some(&json!("Not Found")));
        assert_eq!(value.pointer("/body/error"), Some(&json!("missing")));
    }

    #[test]
    fn resolve_text_stringifies_non_strings() {
        let blackboard = json!({ "n": 7 });
        assert_eq!(resolve_text(&PropValue::reference("$.n"), &blackboard), "7");
        assert_eq!(resolve_text(&PropValue::reference("$.x"), &blackboard), "");
        assert_eq!(
            resolve_text(&PropValue::literal("plain"), &blackboard),
            "plain"
        );
    }
}
