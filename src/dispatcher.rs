//! Per-request orchestration (component H): ties the hook store, request
//! parser, rule evaluator, argument extractor and executor together, and owns
//! the HTTP surface described in spec §6 (`/health`, `/livez`, `/readyz`,
//! `/metrics`, `/version`, `/`, and `{prefix}/{id}`).
//!
//! Grounded on the teacher's `router.rs::route`/`handle` split (parse ->
//! lookup -> validate -> execute -> flatten to one `Result<Response, Infallible>`),
//! generalized from two hard-coded hook kinds to the hook store and the full
//! trigger-rule tree.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::argument::{self, Limits};
use crate::config::Config;
use crate::executor::{ExecError, ExecOutcome, Executor, OutputMode};
use crate::ext::{AuditEvent, AuditSink, RateLimiter};
use crate::hook::Hook;
use crate::logging::LoggingCtx;
use crate::metrics::Metrics;
use crate::request::{self, ParseInput};
use crate::rule::{self, RuleError};
use crate::store::HookStore;

pub struct Dispatcher {
    config: Arc<Config>,
    store: Arc<HookStore>,
    executor: Arc<Executor>,
    metrics: Arc<Metrics>,
    audit: Arc<dyn AuditSink>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        store: Arc<HookStore>,
        executor: Arc<Executor>,
        metrics: Arc<Metrics>,
        audit: Arc<dyn AuditSink>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Dispatcher {
            config,
            store,
            executor,
            metrics,
            audit,
            rate_limiter,
        }
    }

    pub async fn dispatch(
        &self,
        req: Request<Body>,
        remote_addr: SocketAddr,
        log: &mut LoggingCtx,
    ) -> Result<Response<Body>, Infallible> {
        let request_id = self.correlation_id(&req);
        log.request_id(&request_id);

        if !self.rate_limiter.allow(&remote_addr.ip().to_string()) {
            let resp = self.finish(StatusCode::TOO_MANY_REQUESTS, Body::empty(), &request_id);
            return Ok(resp);
        }

        let path = req.uri().path().to_string();
        let response = match path.as_str() {
            "/health" | "/livez" | "/readyz" => self.finish(StatusCode::OK, "OK".into(), &request_id),
            "/metrics" => self.finish(StatusCode::OK, self.metrics.render().into(), &request_id),
            "/version" => self.version_response(&request_id),
            "/" => self.finish(StatusCode::OK, "OK".into(), &request_id),
            _ => match self.hook_id_from_path(&path) {
                Some(id) => self.handle_hook(&id, req, remote_addr, request_id.clone()).await,
                None => self.finish(StatusCode::NOT_FOUND, "Hook not found.".into(), &request_id),
            },
        };

        self.metrics.record_response(response.status().as_u16());
        Ok(response)
    }

    fn hook_id_from_path(&self, path: &str) -> Option<String> {
        let prefix = format!("/{}/", self.config.hooks_prefix.trim_matches('/'));
        let rest = path.strip_prefix(&prefix)?;
        let id = rest.trim().replace(['\n', '\t'], "");
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    fn correlation_id(&self, req: &Request<Body>) -> String {
        if self.config.use_x_request_id {
            if let Some(value) = req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
            {
                if !value.is_empty() && value.len() <= self.config.x_request_id_limit {
                    return value.to_string();
                }
            }
        }
        Uuid::new_v4().simple().to_string()
    }

    fn version_response(&self, request_id: &str) -> Response<Body> {
        let body = serde_json::json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        });
        self.finish(StatusCode::OK, serde_json::to_vec(&body).unwrap().into(), request_id)
    }

    fn finish(&self, status: StatusCode, body: Body, request_id: &str) -> Response<Body> {
        let mut builder = Response::builder().status(status);
        apply_headers(&mut builder, &self.config.global_response_headers, &[]);
        builder
            .header("X-Request-Id", request_id)
            .body(body)
            .expect("response builder with only ascii headers never fails")
    }

    async fn handle_hook(
        &self,
        id: &str,
        req: Request<Body>,
        remote_addr: SocketAddr,
        request_id: String,
    ) -> Response<Body> {
        let hook = match self.store.match_by_id(id).await {
            Some(h) => h,
            None => return self.finish(StatusCode::NOT_FOUND, "Hook not found.".into(), &request_id),
        };

        if !method_allowed(&hook, &self.config, req.method()) {
            return self.response_for_hook(&hook, StatusCode::METHOD_NOT_ALLOWED, Body::empty(), &request_id);
        }

        let (parts, body) = req.into_parts();
        let body = match read_body_capped(body, self.config.max_request_body_size).await {
            Ok(b) => b,
            Err(()) => {
                return self.response_for_hook(
                    &hook,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body too large.".into(),
                    &request_id,
                )
            }
        };

        let mut parsed = request::parse(ParseInput {
            id: request_id.clone(),
            method: parts.method.to_string(),
            remote_addr: remote_addr.to_string(),
            headers: &parts.headers,
            query_string: parts.uri.query().unwrap_or_default(),
            body,
            content_type_override: hook.incoming_content_type.as_deref(),
            max_multipart_memory: self.config.max_multipart_memory,
            allow_signature_errors: hook.trigger_signature_soft_failures,
        })
        .await;
        parsed.apply_json_string_parameters(&hook.json_string_parameters);

        let matched = match &hook.trigger_rule {
            None => true,
            Some(rule) => match rule::evaluate(rule, &parsed) {
                Ok(m) => m,
                Err(RuleError::Parameter(e)) => {
                    log::warn!(target: "hookforge::dispatcher", "id={request_id} rule parameter miss: {e}");
                    false
                }
                Err(e) => {
                    log::error!(target: "hookforge::dispatcher", "id={request_id} rule evaluation failed: {e}");
                    self.audit.record(&AuditEvent {
                        request_id: &request_id,
                        hook_id: Some(&hook.id),
                        remote_addr: &remote_addr.to_string(),
                        outcome: "rule_error",
                    });
                    return self.response_for_hook(
                        &hook,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal error evaluating trigger rule.".into(),
                        &request_id,
                    );
                }
            },
        };

        if !matched {
            let code = hook
                .trigger_rule_mismatch_http_code
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(StatusCode::OK);
            return self.response_for_hook(&hook, code, "Hook rules were not satisfied.".into(), &request_id);
        }

        self.audit.record(&AuditEvent {
            request_id: &request_id,
            hook_id: Some(&hook.id),
            remote_addr: &remote_addr.to_string(),
            outcome: "matched",
        });

        let limits = Limits {
            max_arg_length: self.config.max_arg_length,
            max_total_args_length: self.config.max_total_args_length,
            max_args_count: self.config.max_args_count,
            strict_mode: self.config.strict_mode,
        };
        let extracted = match argument::extract(&hook, &parsed, &limits) {
            Ok(e) => e,
            Err(e) => {
                log::error!(target: "hookforge::dispatcher", "id={request_id} argument validation failed: {e}");
                return self.response_for_hook(
                    &hook,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Invalid arguments for command.".into(),
                    &request_id,
                );
            }
        };

        self.metrics.set_in_flight(self.executor.in_flight());

        if hook.stream_output {
            return self.run_stream(&hook, extracted, &request_id).await;
        }
        let mode = if hook.capture_output || hook.capture_output_on_error {
            OutputMode::Capture
        } else {
            OutputMode::Async
        };
        let outcome = self
            .executor
            .run(hook.working_directory(), extracted, mode, None)
            .await;

        self.metrics.set_in_flight(self.executor.in_flight());
        self.response_for_outcome(&hook, outcome, &request_id)
    }

    async fn run_stream(&self, hook: &Hook, extracted: argument::ExtractedCommand, request_id: &str) -> Response<Body> {
        let success_code = hook
            .success_http_code
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::OK);

        let (status_tx, status_rx) = tokio::sync::oneshot::channel::<StatusCode>();
        let status_tx = Arc::new(AsyncMutex::new(Some(status_tx)));
        let (body_tx, body) = Body::channel();
        let body_tx = Arc::new(AsyncMutex::new(body_tx));

        let sink_status_tx = status_tx.clone();
        let sink_body_tx = body_tx.clone();
        let stream_sink: Box<dyn FnMut(&[u8]) -> BoxFuture<'static, std::io::Result<()>> + Send> =
            Box::new(move |chunk: &[u8]| {
                let status_tx = sink_status_tx.clone();
                let body_tx = sink_body_tx.clone();
                let data = Bytes::copy_from_slice(chunk);
                Box::pin(async move {
                    if let Some(tx) = status_tx.lock().await.take() {
                        let _ = tx.send(success_code);
                    }
                    let mut sender = body_tx.lock().await;
                    sender
                        .send_data(data)
                        .await
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
                })
            });

        let executor = self.executor.clone();
        let working_directory = hook.working_directory().to_string();
        let request_id_for_task = request_id.to_string();
        tokio::spawn(async move {
            let outcome = executor
                .run(&working_directory, extracted, OutputMode::Stream, Some(stream_sink))
                .await;

            if let Some(tx) = status_tx.lock().await.take() {
                let fallback = match &outcome {
                    Ok(_) => success_code,
                    Err(ExecError::DeadlineExceeded) => StatusCode::REQUEST_TIMEOUT,
                    Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let _ = tx.send(fallback);
            }
            if let Err(e) = &outcome {
                log::error!(target: "hookforge::dispatcher", "id={request_id_for_task} streamed command failed: {e}");
            }
        });

        let status = status_rx.await.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = Response::builder().status(status);
        apply_headers(&mut builder, &self.config.global_response_headers, &hook.response_headers);
        builder
            .header("X-Request-Id", request_id)
            .body(body)
            .expect("response builder with only ascii headers never fails")
    }

    fn response_for_outcome(
        &self,
        hook: &Hook,
        outcome: Result<ExecOutcome, ExecError>,
        request_id: &str,
    ) -> Response<Body> {
        match outcome {
            Ok(ExecOutcome::Captured { output, success }) => {
                if success {
                    let code = hook
                        .success_http_code
                        .and_then(|c| StatusCode::from_u16(c).ok())
                        .unwrap_or(StatusCode::OK);
                    let body = if hook.capture_output {
                        Body::from(output)
                    } else {
                        hook.response_message.clone().into()
                    };
                    self.response_for_hook(hook, code, body, request_id)
                } else {
                    let body = if hook.capture_output_on_error {
                        Body::from(output)
                    } else {
                        "Command exited with a non-zero status.".into()
                    };
                    self.response_for_hook(hook, StatusCode::INTERNAL_SERVER_ERROR, body, request_id)
                }
            }
            Ok(ExecOutcome::Detached) => {
                let code = hook
                    .success_http_code
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .unwrap_or(StatusCode::OK);
                self.response_for_hook(hook, code, hook.response_message.clone().into(), request_id)
            }
            Ok(ExecOutcome::Streamed { .. }) => unreachable!("stream mode returns its response directly"),
            Err(ExecError::TooManyConcurrent) => {
                self.response_for_hook(hook, StatusCode::SERVICE_UNAVAILABLE, Body::empty(), request_id)
            }
            Err(ExecError::DeadlineExceeded) => self.response_for_hook(
                hook,
                StatusCode::REQUEST_TIMEOUT,
                "Command timed out.".into(),
                request_id,
            ),
            Err(ExecError::Cancelled) => {
                self.response_for_hook(hook, StatusCode::REQUEST_TIMEOUT, Body::empty(), request_id)
            }
            Err(e) => {
                log::error!(target: "hookforge::dispatcher", "id={request_id} command invocation failed: {e}");
                self.response_for_hook(
                    hook,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Command invocation failed.".into(),
                    request_id,
                )
            }
        }
    }

    fn response_for_hook(&self, hook: &Hook, status: StatusCode, body: Body, request_id: &str) -> Response<Body> {
        let mut builder = Response::builder().status(status);
        apply_headers(&mut builder, &self.config.global_response_headers, &hook.response_headers);
        builder
            .header("X-Request-Id", request_id)
            .body(body)
            .expect("response builder with only ascii headers never fails")
    }
}

fn method_allowed(hook: &Hook, cfg: &Config, method: &Method) -> bool {
    if !hook.http_methods.is_empty() {
        return hook.method_allowed(method.as_str());
    }
    if !cfg.global_http_methods.is_empty() {
        return cfg
            .global_http_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()));
    }
    true
}

/// Apply operator-global headers first, then hook-specific ones, which
/// override on key collision (spec §6).
fn apply_headers(
    builder: &mut hyper::http::response::Builder,
    global: &[crate::hook::ResponseHeader],
    hook_specific: &[crate::hook::ResponseHeader],
) {
    for h in global {
        *builder = std::mem::replace(builder, Response::builder()).header(h.name.as_str(), h.value.as_str());
    }
    for h in hook_specific {
        *builder = std::mem::replace(builder, Response::builder()).header(h.name.as_str(), h.value.as_str());
    }
}

async fn read_body_capped(body: Body, limit: usize) -> Result<Bytes, ()> {
    let mut stream = body;
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| ())?;
        if buf.len() + chunk.len() > limit {
            return Err(());
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}
