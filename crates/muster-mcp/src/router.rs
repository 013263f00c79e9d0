//! Execution router: the single entry point for calling a tool.
//!
//! A call is checked in order: registry lookup, session readiness, argument
//! validation, then the server's circuit breaker. Only then is `tools/call`
//! sent. Timeouts and lost connections are retried under the retry policy;
//! any answer from the server, error or not, is final.

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::error::{CallError, ProtocolError};
use crate::manager::SessionManager;
use crate::registry::{ToolDescriptor, ToolRegistry};
use crate::retry::{RetryPolicy, is_retryable};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// One accepted tool invocation, alive until it reaches a terminal outcome.
struct PendingCall {
    tool: Arc<ToolDescriptor>,
    arguments: Value,
    started: Instant,
    timeout: Duration,
    attempts: u32,
}

impl PendingCall {
    /// Deadline for the next attempt; every attempt gets the full timeout.
    fn next_deadline(&mut self) -> Instant {
        self.attempts += 1;
        Instant::now() + self.timeout
    }
}

pub struct ExecutionRouter {
    registry: Arc<ToolRegistry>,
    manager: Arc<SessionManager>,
    retry: RetryPolicy,
    breaker_config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ExecutionRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<SessionManager>,
        retry: RetryPolicy,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            retry,
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_breaker<R>(&self, server: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breakers = self.breakers();
        let breaker = breakers
            .entry(server.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config.clone()));
        f(breaker)
    }

    /// Circuit state for `server`.
    pub fn circuit_state(&self, server: &str) -> CircuitState {
        self.breakers()
            .get(server)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Call a tool by qualified name and return its `content`.
    ///
    /// `timeout` bounds each attempt; without one the server's configured
    /// call timeout applies.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let tool = self
            .registry
            .lookup(qualified_name)
            .ok_or_else(|| CallError::UnknownTool {
                name: qualified_name.to_string(),
            })?;

        if self.manager.get_session(&tool.server).is_none() {
            return Err(CallError::ServerUnavailable {
                server: tool.server.clone(),
            });
        }

        tool.validate(&arguments)
            .map_err(|errors| CallError::InvalidArguments {
                tool: qualified_name.to_string(),
                errors,
            })?;

        let timeout = timeout.unwrap_or_else(|| self.manager.call_timeout(&tool.server));
        let mut call = PendingCall {
            tool,
            arguments,
            started: Instant::now(),
            timeout,
            attempts: 0,
        };
        let outcome = self.dispatch(&mut call).await;
        tracing::debug!(
            tool = %call.tool.qualified_name,
            attempts = call.attempts,
            elapsed_ms = call.started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "tool call finished"
        );
        outcome
    }

    async fn dispatch(&self, call: &mut PendingCall) -> Result<Value, CallError> {
        let server = call.tool.server.clone();
        let qualified = call.tool.qualified_name.clone();

        loop {
            self.with_breaker(&server, |b| b.try_acquire(Instant::now()))
                .map_err(|wait| CallError::CircuitOpen {
                    server: server.clone(),
                    retry_in_ms: wait.as_millis() as u64,
                })?;

            // Reconnects swap sessions, so resolve it again on every attempt.
            let Some(session) = self.manager.get_session(&server) else {
                self.with_breaker(&server, CircuitBreaker::release);
                return Err(CallError::ServerUnavailable { server });
            };

            let deadline = call.next_deadline();
            let result = session
                .call_tool(&call.tool.name, call.arguments.clone(), deadline)
                .await;

            match result {
                Ok(result) => {
                    self.with_breaker(&server, CircuitBreaker::record_success);
                    return tool_result(&qualified, result);
                }
                Err(ProtocolError::Rpc {
                    code,
                    message,
                    data,
                }) => {
                    self.with_breaker(&server, CircuitBreaker::record_success);
                    return Err(CallError::ToolExecutionError {
                        tool: qualified,
                        message,
                        details: json!({ "code": code, "data": data }),
                    });
                }
                Err(e) if is_retryable(&e) => {
                    self.with_breaker(&server, |b| b.record_failure(Instant::now()));
                    let retries_used = call.attempts - 1;
                    if retries_used >= self.retry.max_retries {
                        tracing::warn!(
                            "tool '{}' failed after {} attempts: {}",
                            qualified,
                            call.attempts,
                            e
                        );
                        return Err(CallError::Exhausted {
                            tool: qualified,
                            attempts: call.attempts,
                            last_error: e,
                        });
                    }
                    let delay = self.retry.delay_for(retries_used);
                    tracing::warn!(
                        "tool '{}' attempt {} failed ({}), retrying in {}ms",
                        qualified,
                        call.attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ProtocolError::NotReady { .. }) => {
                    self.with_breaker(&server, CircuitBreaker::release);
                    return Err(CallError::ServerUnavailable { server });
                }
                Err(e) => {
                    self.with_breaker(&server, CircuitBreaker::release);
                    return Err(CallError::Protocol {
                        tool: qualified,
                        source: e,
                    });
                }
            }
        }
    }
}

/// Turn a `tools/call` result into the call's outcome.
fn tool_result(tool: &str, result: Value) -> Result<Value, CallError> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| "tool reported an error".to_string());
        return Err(CallError::ToolExecutionError {
            tool: tool.to_string(),
            message,
            details: result,
        });
    }

    Ok(result
        .get("content")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new())))
}
