//! Dispatch of actions and retrieval of their results

use crate::client::{ActionCache, Execution, OperationStream};
use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::proto::google::longrunning::{Operation, operation};
use crate::proto::google::rpc::Status;
use crate::reapi::{self, execution_stage};
use crate::retry::retry_with_backoff;
use futures::StreamExt;
use prost::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Times a broken operation stream is re-attached before giving up
pub const MAX_REATTACH_ATTEMPTS: usize = 3;

const DEADLINE_EXCEEDED: i32 = tonic::Code::DeadlineExceeded as i32;

/// Where an unfinished execution stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProgress {
    /// Checked against the cache or waiting for a worker
    Pending,
    /// Running on a worker
    Running,
}

impl ExecutionProgress {
    fn from_stage(stage: i32) -> Option<Self> {
        match execution_stage::Value::try_from(stage).ok()? {
            execution_stage::Value::CacheCheck | execution_stage::Value::Queued => {
                Some(Self::Pending)
            }
            execution_stage::Value::Executing => Some(Self::Running),
            execution_stage::Value::Unknown | execution_stage::Value::Completed => None,
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The command ran; its exit code is in the result
    Completed {
        /// The action's result
        result: reapi::ActionResult,
        /// Served from the action cache
        cached: bool,
    },
    /// The server could not run the action
    Failed {
        /// Why
        status: Status,
        /// Partial result, if the server sent one
        result: Option<reapi::ActionResult>,
    },
    /// The action exceeded its timeout on the worker
    TimedOut {
        /// Partial result, if the server sent one
        result: Option<reapi::ActionResult>,
    },
}

/// Runs actions through the execution service
pub struct Executor {
    execution: Arc<dyn Execution>,
    action_cache: Arc<dyn ActionCache>,
    remote_cache: bool,
    retry: RetryConfig,
}

impl Executor {
    /// Create an executor; with `remote_cache` off the action cache is never consulted
    pub fn new(
        execution: Arc<dyn Execution>,
        action_cache: Arc<dyn ActionCache>,
        remote_cache: bool,
        retry: RetryConfig,
    ) -> Self {
        Self {
            execution,
            action_cache,
            remote_cache,
            retry,
        }
    }

    /// Look the action up in the action cache.
    ///
    /// Only successful results count as hits; lookup failures are treated as misses.
    pub async fn cached_result(&self, action_digest: &Digest) -> Option<reapi::ActionResult> {
        if !self.remote_cache {
            return None;
        }
        match self.action_cache.get_action_result(action_digest).await {
            Ok(Some(result)) if result.exit_code == 0 => {
                info!(action = %action_digest, "Action cache hit");
                Some(result)
            }
            Ok(Some(result)) => {
                debug!(action = %action_digest, exit_code = result.exit_code, "Ignoring cached failure");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(action = %action_digest, error = %e, "Failed to check action cache, proceeding with execution");
                None
            }
        }
    }

    /// Execute an action and wait for it to finish
    pub async fn execute(&self, action_digest: &Digest) -> Result<ExecutionOutcome> {
        let skip_cache_lookup = !self.remote_cache;
        let mut stream = retry_with_backoff(&self.retry, "Execute", || {
            self.execution.execute(action_digest, skip_cache_lookup)
        })
        .await?;

        let mut operation_name = String::new();
        let mut progress = None;
        let mut reattached = 0;
        loop {
            let broken = match stream.next().await {
                Some(Ok(op)) => {
                    if !op.name.is_empty() {
                        operation_name.clone_from(&op.name);
                    }
                    if op.done {
                        return decode_outcome(op);
                    }
                    log_progress(&op, action_digest, &mut progress);
                    continue;
                }
                Some(Err(e)) => e.to_string(),
                None => "stream closed".to_string(),
            };

            if operation_name.is_empty() || reattached >= MAX_REATTACH_ATTEMPTS {
                return Err(RemoteError::protocol(format!(
                    "execution of {action_digest} ended before completion: {broken}"
                )));
            }
            reattached += 1;
            warn!(
                action = %action_digest,
                operation = %operation_name,
                attempt = reattached,
                reason = %broken,
                "Operation stream broke, re-attaching"
            );
            stream = self.reattach(&operation_name).await?;
        }
    }

    async fn reattach(&self, operation_name: &str) -> Result<OperationStream> {
        retry_with_backoff(&self.retry, "WaitExecution", || {
            self.execution.wait_execution(operation_name)
        })
        .await
    }
}

fn log_progress(op: &Operation, action_digest: &Digest, last: &mut Option<ExecutionProgress>) {
    let Some(metadata) = op.metadata.as_ref() else {
        return;
    };
    if metadata.type_url != reapi::EXECUTE_METADATA_TYPE_URL {
        return;
    }
    let Ok(metadata) = reapi::ExecuteOperationMetadata::decode(metadata.value.as_slice()) else {
        return;
    };
    let current = ExecutionProgress::from_stage(metadata.stage);
    if current.is_some() && current != *last {
        debug!(action = %action_digest, operation = %op.name, progress = ?current, "Execution progress");
        *last = current;
    }
}

/// Turn a finished operation into an outcome
fn decode_outcome(op: Operation) -> Result<ExecutionOutcome> {
    let any = match op.result {
        Some(operation::Result::Error(status)) => {
            return Ok(ExecutionOutcome::Failed {
                status,
                result: None,
            });
        }
        Some(operation::Result::Response(any)) => any,
        None => {
            return Err(RemoteError::protocol(format!(
                "operation {} is done but carries no result",
                op.name
            )));
        }
    };
    if any.type_url != reapi::EXECUTE_RESPONSE_TYPE_URL {
        return Err(RemoteError::protocol(format!(
            "unexpected operation response type {}",
            any.type_url
        )));
    }
    let response = reapi::ExecuteResponse::decode(any.value.as_slice())
        .map_err(|e| RemoteError::protocol(format!("invalid ExecuteResponse: {e}")))?;

    match response.status {
        Some(status) if status.code == DEADLINE_EXCEEDED => Ok(ExecutionOutcome::TimedOut {
            result: response.result,
        }),
        Some(status) if !status.is_ok() => Ok(ExecutionOutcome::Failed {
            status,
            result: response.result,
        }),
        _ => {
            let result = response.result.ok_or_else(|| {
                RemoteError::protocol(format!("operation {} finished without a result", op.name))
            })?;
            Ok(ExecutionOutcome::Completed {
                result,
                cached: response.cached_result,
            })
        }
    }
}

/// Wrap an ExecuteResponse into a finished operation
#[must_use]
pub fn completed_operation(name: impl Into<String>, response: &reapi::ExecuteResponse) -> Operation {
    Operation {
        name: name.into(),
        metadata: None,
        done: true,
        result: Some(operation::Result::Response(prost_types::Any {
            type_url: reapi::EXECUTE_RESPONSE_TYPE_URL.to_string(),
            value: response.encode_to_vec(),
        })),
    }
}

/// An unfinished operation at the given stage
#[must_use]
pub fn pending_operation(name: impl Into<String>, stage: execution_stage::Value) -> Operation {
    let metadata = reapi::ExecuteOperationMetadata {
        stage: stage as i32,
        action_digest: None,
    };
    Operation {
        name: name.into(),
        metadata: Some(prost_types::Any {
            type_url: reapi::EXECUTE_METADATA_TYPE_URL.to_string(),
            value: metadata.encode_to_vec(),
        }),
        done: false,
        result: None,
    }
}
