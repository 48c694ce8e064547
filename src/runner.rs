use crate::config::EngineSettings;
use crate::context::{display_value, Context, ValuePath};
use crate::error::TemplateError;
use crate::model::{ActionNode, DelayRange, PostProcessor};
use crate::template::{self, RenderedRequest};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What one HTTP attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status_code: u16,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Exchange {
    Completed { outcome: Outcome, body: Option<Value> },
    /// Cut off by the cancellation token before a response arrived.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Outcome(Outcome),
    Aborted,
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Builds the HTTP client of the worker with the given id.
pub type ClientFactory = Arc<dyn Fn(usize) -> reqwest::Result<Client> + Send + Sync>;

/// Issues the requests of one worker over its shared client.
#[derive(Clone)]
pub struct Runner {
    client: Client,
    timeout: Duration,
    transport_error_status: u16,
}

impl Runner {
    /// Pooled client with a cookie store, shared by every user of a worker.
    pub fn build_client() -> reqwest::Result<Client> {
        Client::builder().cookie_store(true).build()
    }

    pub fn new(client: Client, settings: &EngineSettings) -> Self {
        Self {
            client,
            timeout: settings.request_timeout(),
            transport_error_status: settings.transport_error_status,
        }
    }

    /// Pre-processor, render, HTTP call, post-processor.
    pub async fn run_step(
        &self,
        node: &ActionNode,
        ctx: &mut Context,
        cancel: &CancellationToken,
    ) -> Result<StepResult, TemplateError> {
        if let Some(pre) = node.pre() {
            ctx.merge(&pre.inject);
            ctx.alias(&pre.alias);
        }

        let request = template::render(node, ctx)?;
        let (mut outcome, body) = match self.execute(&request, cancel).await? {
            Exchange::Completed { outcome, body } => (outcome, body),
            Exchange::Aborted => return Ok(StepResult::Aborted),
        };
        tracing::debug!(
            endpoint = %node.id,
            status = outcome.status_code,
            latency_ms = outcome.latency_ms,
            "step finished"
        );

        if let Some(post) = node.post() {
            if !outcome.is_error() {
                apply_post(post, body.as_ref(), ctx, &mut outcome);
            }
            if let Some(delay) = post.delay {
                pause(sample_delay(delay), cancel).await;
            }
        }

        Ok(StepResult::Outcome(outcome))
    }

    pub async fn execute(
        &self,
        request: &RenderedRequest,
        cancel: &CancellationToken,
    ) -> Result<Exchange, TemplateError> {
        let mut builder = self
            .client
            .request(request.method.into(), request.url.as_str())
            .headers(header_map(request)?)
            .timeout(self.timeout);
        let query = request.query_pairs();
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let call = async {
            let response = builder.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Exchange::Aborted),
            result = call => result,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let exchange = match result {
            Ok((status, bytes)) => Exchange::Completed {
                outcome: Outcome {
                    status_code: status.as_u16(),
                    latency_ms,
                    error: (!status.is_success())
                        .then(|| format!("Request failed with status code {}", status.as_u16())),
                },
                body: serde_json::from_slice(&bytes).ok(),
            },
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "transport failure");
                Exchange::Completed {
                    outcome: Outcome {
                        status_code: self.transport_error_status,
                        latency_ms,
                        error: Some(e.to_string()),
                    },
                    body: None,
                }
            }
        };
        Ok(exchange)
    }
}

fn header_map(request: &RenderedRequest) -> Result<HeaderMap, TemplateError> {
    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        let invalid = |reason: String| TemplateError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

static NULL: Value = Value::Null;

fn apply_post(post: &PostProcessor, body: Option<&Value>, ctx: &mut Context, outcome: &mut Outcome) {
    let body = body.unwrap_or(&NULL);

    for (key, path) in &post.extract {
        let value = ValuePath::parse(path)
            .resolve(body)
            .cloned()
            .unwrap_or(Value::Null);
        ctx.set(key.clone(), value);
    }
    ctx.alias(&post.alias);

    for (path, expected) in &post.assert {
        let actual = ValuePath::parse(path).resolve(body);
        let actual_text = actual.map(display_value).unwrap_or_default();
        if actual.is_none() || actual_text != expected.as_str() {
            outcome.error = Some(format!(
                "Assertion failed on {path}: expected {expected}, got {}",
                actual.map(Value::to_string).unwrap_or_else(|| "nothing".into())
            ));
            break;
        }
    }
}

fn sample_delay(delay: DelayRange) -> Duration {
    let (lo, hi) = if delay.min <= delay.max {
        (delay.min, delay.max)
    } else {
        (delay.max, delay.min)
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HttpMethod, PreProcessor, Processor};
    use serde_json::json;
    use indexmap::IndexMap;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner() -> Runner {
        Runner::new(Runner::build_client().unwrap(), &EngineSettings::default())
    }

    fn node(id: &str, method: HttpMethod, url: String) -> ActionNode {
        ActionNode {
            id: id.into(),
            name: id.into(),
            method,
            url,
            headers: HashMap::new(),
            body: None,
            parameters: None,
            processor: None,
        }
    }

    fn with_post(mut node: ActionNode, post: PostProcessor) -> ActionNode {
        node.processor = Some(Processor {
            pre: None,
            post: Some(post),
        });
        node
    }

    #[tokio::test]
    async fn extract_wildcard_picks_from_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"items": [1, 2, 3]}})),
            )
            .mount(&server)
            .await;

        let step = with_post(
            node("items", HttpMethod::Get, format!("{}/items", server.uri())),
            PostProcessor {
                extract: IndexMap::from([("pick".to_string(), "data.items[*]".to_string())]),
                ..Default::default()
            },
        );
        let mut ctx = Context::new();
        let result = runner()
            .run_step(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        let StepResult::Outcome(outcome) = result else {
            panic!("expected an outcome");
        };
        assert_eq!(outcome.status_code, 200);
        assert!(outcome.error.is_none());
        let pick = ctx.get("pick").and_then(Value::as_i64).unwrap();
        assert!([1, 2, 3].contains(&pick));
    }

    #[tokio::test]
    async fn pre_processor_feeds_the_rendered_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orgs/acme/login"))
            .and(header("x-user", "alice"))
            .and(query_param("lang", "en"))
            .and(body_json(json!({"user": "alice", "tries": 1})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "t-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut step = node(
            "login",
            HttpMethod::Post,
            "{{baseUrl}}/orgs/:org/login".to_string(),
        );
        step.headers.insert("x-user".into(), "{{login}}".into());
        step.body = Some(json!({"user": "{{login}}", "tries": 1}));
        step.parameters = Some(json!({"lang": "en"}).as_object().cloned().unwrap());
        step.processor = Some(Processor {
            pre: Some(PreProcessor {
                inject: json!({"org": "acme"}).as_object().cloned().unwrap(),
                alias: IndexMap::from([("username".to_string(), "login".to_string())]),
            }),
            post: Some(PostProcessor {
                extract: IndexMap::from([("token".to_string(), "token".to_string())]),
                alias: IndexMap::from([("token".to_string(), "bearer".to_string())]),
                ..Default::default()
            }),
        });

        let mut ctx = Context::from(
            json!({"baseUrl": server.uri(), "username": "alice"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let result = runner()
            .run_step(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(result, StepResult::Outcome(Outcome { status_code: 201, error: None, .. })));
        assert_eq!(ctx.get("token"), Some(&json!("t-1")));
        assert_eq!(ctx.get("bearer"), Some(&json!("t-1")));
        assert_eq!(ctx.get("org"), Some(&json!("acme")));
    }

    #[tokio::test]
    async fn non_success_status_carries_an_error_and_skips_extract() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"id": 9})))
            .mount(&server)
            .await;

        let step = with_post(
            node("missing", HttpMethod::Get, format!("{}/nope", server.uri())),
            PostProcessor {
                extract: IndexMap::from([("id".to_string(), "id".to_string())]),
                ..Default::default()
            },
        );
        let mut ctx = Context::new();
        let result = runner()
            .run_step(&step, &mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        let StepResult::Outcome(outcome) = result else {
            panic!("expected an outcome");
        };
        assert_eq!(outcome.status_code, 404);
        assert_eq!(outcome.error.as_deref(), Some("Request failed with status code 404"));
        assert!(ctx.get("id").is_none());
    }

    #[tokio::test]
    async fn transport_failure_maps_to_synthetic_status() {
        let step = node("down", HttpMethod::Get, "http://127.0.0.1:1/".to_string());
        let result = runner()
            .run_step(&step, &mut Context::new(), &CancellationToken::new())
            .await
            .unwrap();

        let StepResult::Outcome(outcome) = result else {
            panic!("expected an outcome");
        };
        assert_eq!(outcome.status_code, 500);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn cancellation_during_call_yields_no_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let step = node("slow", HttpMethod::Get, server.uri());
        let started = Instant::now();
        let result = runner()
            .run_step(&step, &mut Context::new(), &cancel)
            .await
            .unwrap();

        assert_eq!(result, StepResult::Aborted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn failed_assertion_turns_into_error_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "down"})))
            .mount(&server)
            .await;

        let step = with_post(
            node("health", HttpMethod::Get, server.uri()),
            PostProcessor {
                assert: IndexMap::from([("status".to_string(), "ok".to_string())]),
                ..Default::default()
            },
        );
        let result = runner()
            .run_step(&step, &mut Context::new(), &CancellationToken::new())
            .await
            .unwrap();

        let StepResult::Outcome(outcome) = result else {
            panic!("expected an outcome");
        };
        assert_eq!(outcome.status_code, 200);
        assert!(outcome.error.unwrap().contains("expected ok"));
    }

    #[tokio::test]
    async fn post_delay_is_not_part_of_latency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let step = with_post(
            node("paced", HttpMethod::Get, server.uri()),
            PostProcessor {
                delay: Some(DelayRange { min: 300, max: 300 }),
                ..Default::default()
            },
        );
        let started = Instant::now();
        let result = runner()
            .run_step(&step, &mut Context::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        let StepResult::Outcome(outcome) = result else {
            panic!("expected an outcome");
        };
        assert!(outcome.latency_ms < 300);
    }

    #[tokio::test]
    async fn missing_path_param_fails_before_sending() {
        let step = node("user", HttpMethod::Get, "http://127.0.0.1:1/users/:id".to_string());
        let err = runner()
            .run_step(&step, &mut Context::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TemplateError::MissingPathParam("id".into()));
    }

    #[tokio::test]
    async fn cookies_are_shared_by_one_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let runner = runner();
        let cancel = CancellationToken::new();
        let login = node("login", HttpMethod::Get, format!("{}/login", server.uri()));
        let me = node("me", HttpMethod::Get, format!("{}/me", server.uri()));

        runner.run_step(&login, &mut Context::new(), &cancel).await.unwrap();
        let result = runner.run_step(&me, &mut Context::new(), &cancel).await.unwrap();
        assert!(matches!(result, StepResult::Outcome(Outcome { status_code: 200, .. })));
    }
}
