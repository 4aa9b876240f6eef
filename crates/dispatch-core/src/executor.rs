use crate::config::{TargetConfig, TargetKind};
use crate::error::DispatchResult;
use crate::outcome::{ErrorKind, Outcome};
use crate::report::truncate;
use crate::sink::{ResponseRecord, ResponseSink};
use crate::task::Task;
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Longest raw body excerpt kept in an error detail.
const DETAIL_CHARS: usize = 200;

/// Performs exactly one request/response cycle for a task. Every failure
/// is folded into the returned [`Outcome`].
pub trait CallExecutor<P>: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        task: &'a Task<P>,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>>;

    /// Wait for background work started by earlier calls, such as response
    /// persistence. Called once after the last call has been collected.
    fn flush<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Builds the JSON request body for a task.
pub trait PayloadBuilder<P>: Send + Sync {
    fn build(&self, task: &Task<P>) -> Value;
}

/// `{model, messages:[{role:"user", content}], stream:false}`
#[derive(Debug, Clone)]
pub struct ChatPayload {
    pub model: String,
    pub max_tokens: Option<u32>,
}

impl PayloadBuilder<String> for ChatPayload {
    fn build(&self, task: &Task<String>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": task.payload}],
            "stream": false,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

/// Image generation request returning base64 data.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub model: String,
    pub size: String,
    pub quality: String,
}

impl PayloadBuilder<String> for ImagePayload {
    fn build(&self, task: &Task<String>) -> Value {
        json!({
            "model": self.model,
            "prompt": task.payload,
            "n": 1,
            "size": self.size,
            "quality": self.quality,
            "response_format": "b64_json",
            "user": format!("batch-{}", task.id),
        })
    }
}

/// Turns a received response into an [`Outcome`].
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    /// Top-level field that marks a failure inside a 2xx body
    pub error_field: String,
    /// JSON pointer to the answer; empty disables extraction
    pub answer_pointer: String,
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self {
            error_field: "error".to_string(),
            answer_pointer: "/choices/0/message/content".to_string(),
        }
    }
}

impl ResponseClassifier {
    /// Classify a response and return the decoded body when there is one.
    pub fn classify(
        &self,
        task_id: u64,
        status: u16,
        body: &str,
        elapsed: Duration,
    ) -> (Outcome, Option<Value>) {
        let decoded = serde_json::from_str::<Value>(body);

        if !(200..300).contains(&status) {
            let detail = decoded
                .as_ref()
                .ok()
                .and_then(|v| self.failure_marker(v))
                .unwrap_or_else(|| truncate(body, DETAIL_CHARS));
            let outcome = Outcome::status(task_id, status, elapsed, detail).with_raw_response(body);
            return (outcome, decoded.ok());
        }

        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                let detail = format!("invalid JSON body ({e}): {}", truncate(body, DETAIL_CHARS));
                let outcome = Outcome::decode(task_id, status, elapsed, detail).with_raw_response(body);
                return (outcome, None);
            }
        };

        if let Some(detail) = self.failure_marker(&value) {
            let outcome = Outcome::upstream(task_id, status, elapsed, detail).with_raw_response(body);
            return (outcome, Some(value));
        }

        let answer = self.answer(&value);
        (Outcome::success(task_id, status, elapsed, answer), Some(value))
    }

    fn failure_marker(&self, body: &Value) -> Option<String> {
        let marker = body.get(&self.error_field)?;
        match marker {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => {
                let message = obj.get("message").and_then(Value::as_str);
                let kind = obj.get("type").and_then(Value::as_str);
                match (kind, message) {
                    (Some(kind), Some(message)) => Some(format!("{kind}: {message}")),
                    (None, Some(message)) => Some(message.to_string()),
                    _ => Some(marker.to_string()),
                }
            }
            other => Some(other.to_string()),
        }
    }

    fn answer(&self, body: &Value) -> Option<String> {
        if self.answer_pointer.is_empty() {
            return None;
        }
        match body.pointer(&self.answer_pointer)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Posts a JSON body built per task to a fixed endpoint.
pub struct HttpJsonExecutor<P> {
    client: reqwest::Client,
    url: String,
    authorization: Option<String>,
    builder: Box<dyn PayloadBuilder<P>>,
    classifier: ResponseClassifier,
    timeout: Duration,
    sink: Option<Arc<dyn ResponseSink>>,
    /// Pending sink writes; they run outside the call so they never count
    /// against its timeout
    persisting: TaskTracker,
}

impl<P> HttpJsonExecutor<P> {
    pub fn new(
        url: impl Into<String>,
        authorization: Option<String>,
        builder: Box<dyn PayloadBuilder<P>>,
        timeout: Duration,
    ) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            authorization,
            builder,
            classifier: ResponseClassifier::default(),
            timeout,
            sink: None,
            persisting: TaskTracker::new(),
        })
    }

    pub fn with_classifier(mut self, classifier: ResponseClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl HttpJsonExecutor<String> {
    /// Executor for a configured chat or image endpoint.
    pub fn from_config(target: &TargetConfig, timeout: Duration) -> DispatchResult<Self> {
        let builder: Box<dyn PayloadBuilder<String>> = match target.kind {
            TargetKind::Chat => Box::new(ChatPayload {
                model: target.model.clone(),
                max_tokens: target.max_tokens,
            }),
            TargetKind::Image => Box::new(ImagePayload {
                model: target.model.clone(),
                size: target.size.clone(),
                quality: target.quality.clone(),
            }),
        };
        let classifier = ResponseClassifier {
            error_field: target.error_field.clone(),
            answer_pointer: target.answer_pointer.clone(),
        };
        Ok(Self::new(target.url.clone(), target.authorization(), builder, timeout)?
            .with_classifier(classifier))
    }
}

impl<P> CallExecutor<P> for HttpJsonExecutor<P>
where
    P: Serialize + Send + Sync,
{
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        task: &'a Task<P>,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();
            let body = self.builder.build(task);

            let mut request = self.client.post(&self.url).json(&body);
            if let Some(auth) = &self.authorization {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let detail = describe_transport(&e, self.timeout);
                    debug!(task_id = task.id, "transport failure: {detail}");
                    return Outcome::transport(task.id, start.elapsed(), detail);
                }
            };

            let status = response.status().as_u16();
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    let detail = format!(
                        "status {status}, body read failed: {}",
                        describe_transport(&e, self.timeout)
                    );
                    return Outcome::transport(task.id, start.elapsed(), detail);
                }
            };
            let elapsed = start.elapsed();

            let (outcome, decoded) = self.classifier.classify(task.id, status, &text, elapsed);
            if outcome.error_kind() != ErrorKind::None {
                debug!(
                    task_id = task.id,
                    status,
                    kind = %outcome.error_kind(),
                    "call failed: {}",
                    outcome.error_detail().unwrap_or_default()
                );
            }

            if let Some(sink) = &self.sink {
                let raw_response = decoded.is_none().then_some(text);
                let record = ResponseRecord {
                    task_id: task.id,
                    cycle: task.cycle,
                    payload: serde_json::to_value(&task.payload).unwrap_or(Value::Null),
                    status_code: Some(status),
                    elapsed_ms: elapsed.as_millis() as u64,
                    response: decoded,
                    raw_response,
                    answer: outcome.answer().map(str::to_string),
                };
                let sink = sink.clone();
                self.persisting.spawn(async move {
                    let task_id = record.task_id;
                    if let Err(e) = sink.persist(record).await {
                        warn!(task_id, sink = sink.name(), "failed to persist response: {e}");
                    }
                });
            }

            outcome
        })
    }

    fn flush<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.persisting.is_empty() {
                return;
            }
            debug!("waiting for {} response writes", self.persisting.len());
            self.persisting.close();
            self.persisting.wait().await;
            self.persisting.reopen();
        })
    }
}

fn describe_transport(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        return format!("request timed out after {}ms", timeout.as_millis());
    }
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    detail
}

/// Executor for dry runs and tests: waits a fixed delay, then reports the
/// configured kind of outcome.
pub struct MockExecutor {
    delay: Duration,
    kind: ErrorKind,
}

impl MockExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            kind: ErrorKind::None,
        }
    }

    pub fn failing(delay: Duration, kind: ErrorKind) -> Self {
        Self { delay, kind }
    }
}

impl<P: Sync> CallExecutor<P> for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        task: &'a Task<P>,
    ) -> Pin<Box<dyn std::future::Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            sleep(self.delay).await;
            match self.kind {
                ErrorKind::None => Outcome::success(
                    task.id,
                    200,
                    self.delay,
                    Some(format!("mock answer {}", task.id)),
                ),
                ErrorKind::Transport => {
                    Outcome::transport(task.id, self.delay, "mock connection refused")
                }
                ErrorKind::Status => Outcome::status(task.id, 500, self.delay, "mock server error"),
                ErrorKind::Decode => Outcome::decode(task.id, 200, self.delay, "mock invalid JSON"),
                ErrorKind::UpstreamSemantic => Outcome::upstream(
                    task.id,
                    200,
                    self.delay,
                    "Failed to request upstream address",
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64, prompt: &str) -> Task<String> {
        Task {
            id,
            cycle: 1,
            payload: prompt.to_string(),
        }
    }

    #[test]
    fn test_chat_payload_shape() {
        let builder = ChatPayload {
            model: "gpt-4o-mini".to_string(),
            max_tokens: Some(10),
        };
        let body = builder.build(&task(1, "answer yes."));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "answer yes.");
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn test_image_payload_tags_user() {
        let builder = ImagePayload {
            model: "gpt-image-1".to_string(),
            size: "1024x1024".to_string(),
            quality: "medium".to_string(),
        };
        let body = builder.build(&task(42, "a lighthouse"));
        assert_eq!(body["prompt"], "a lighthouse");
        assert_eq!(body["user"], "batch-42");
        assert_eq!(body["response_format"], "b64_json");
    }

    #[test]
    fn test_classify_success_extracts_answer() {
        let classifier = ResponseClassifier::default();
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"yes"}}]}"#;
        let (outcome, decoded) = classifier.classify(1, 200, body, Duration::from_millis(5));
        assert!(outcome.is_success());
        assert_eq!(outcome.answer(), Some("yes"));
        assert!(decoded.is_some());
    }

    #[test]
    fn test_classify_error_inside_200() {
        let classifier = ResponseClassifier::default();
        let body = r#"{"error":"Failed to request upstream address"}"#;
        let (outcome, _) = classifier.classify(2, 200, body, Duration::from_millis(5));
        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind(), ErrorKind::UpstreamSemantic);
        assert_eq!(outcome.status_code(), Some(200));
        assert_eq!(outcome.error_detail(), Some("Failed to request upstream address"));
    }

    #[test]
    fn test_classify_error_object_message() {
        let classifier = ResponseClassifier::default();
        let body = r#"{"error":{"type":"upstream_error","message":"model overloaded"}}"#;
        let (outcome, _) = classifier.classify(3, 200, body, Duration::ZERO);
        assert_eq!(outcome.error_detail(), Some("upstream_error: model overloaded"));
    }

    #[test]
    fn test_classify_null_error_is_success() {
        let classifier = ResponseClassifier::default();
        let body = r#"{"error":null,"choices":[{"message":{"content":"ok"}}]}"#;
        let (outcome, _) = classifier.classify(4, 200, body, Duration::ZERO);
        assert!(outcome.is_success());
    }

    #[test]
    fn test_classify_undecodable_body() {
        let classifier = ResponseClassifier::default();
        let (outcome, decoded) = classifier.classify(5, 200, "<html>bad gateway</html>", Duration::ZERO);
        assert_eq!(outcome.error_kind(), ErrorKind::Decode);
        assert_eq!(outcome.status_code(), Some(200));
        assert!(decoded.is_none());
        assert!(outcome.error_detail().unwrap().contains("<html>"));
    }

    #[test]
    fn test_classify_non_2xx() {
        let classifier = ResponseClassifier::default();
        let body = r#"{"error":{"message":"rate limited"}}"#;
        let (outcome, _) = classifier.classify(6, 429, body, Duration::ZERO);
        assert_eq!(outcome.error_kind(), ErrorKind::Status);
        assert_eq!(outcome.status_code(), Some(429));
        assert_eq!(outcome.error_detail(), Some("rate limited"));

        let (outcome, _) = classifier.classify(7, 502, "Bad Gateway", Duration::ZERO);
        assert_eq!(outcome.error_kind(), ErrorKind::Status);
        assert_eq!(outcome.error_detail(), Some("Bad Gateway"));
        assert_eq!(outcome.raw_response(), Some("Bad Gateway"));
    }

    #[test]
    fn test_classify_keeps_full_body_on_failure() {
        let classifier = ResponseClassifier::default();
        let body = format!("<html>{}</html>", "x".repeat(1000));
        let (outcome, _) = classifier.classify(11, 200, &body, Duration::ZERO);
        assert_eq!(outcome.error_kind(), ErrorKind::Decode);
        assert!(outcome.error_detail().unwrap().len() < body.len());
        assert_eq!(outcome.raw_response(), Some(body.as_str()));

        let ok = r#"{"choices":[{"message":{"content":"yes"}}]}"#;
        let (outcome, _) = classifier.classify(12, 200, ok, Duration::ZERO);
        assert_eq!(outcome.raw_response(), None);
    }

    #[test]
    fn test_classify_custom_pointer() {
        let classifier = ResponseClassifier {
            error_field: "error".to_string(),
            answer_pointer: "/data/0/url".to_string(),
        };
        let body = r#"{"data":[{"url":"https://cdn.example.com/1.png"}]}"#;
        let (outcome, _) = classifier.classify(8, 200, body, Duration::ZERO);
        assert_eq!(outcome.answer(), Some("https://cdn.example.com/1.png"));

        let no_answer = ResponseClassifier {
            answer_pointer: String::new(),
            ..classifier
        };
        let (outcome, _) = no_answer.classify(8, 200, body, Duration::ZERO);
        assert!(outcome.is_success());
        assert_eq!(outcome.answer(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_executor() {
        let executor = MockExecutor::new(Duration::from_millis(5));
        let outcome = executor.execute(&task(9, "q")).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.task_id(), 9);

        let failing = MockExecutor::failing(Duration::ZERO, ErrorKind::UpstreamSemantic);
        let outcome = CallExecutor::<String>::execute(&failing, &task(10, "q")).await;
        assert_eq!(outcome.error_kind(), ErrorKind::UpstreamSemantic);
    }
}
