//! Parallel Executor
//!
//! Fork-join primitive used by every pipeline stage. Each task runs on its
//! own tokio task under its own timeout; faults are turned into failed
//! `AgentResult`s at the task boundary so nothing escapes the join.

use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentResult, AgentRole};
use crate::error::AgentError;
use crate::orchestrator::QueryContext;

/// One unit of work: an agent filling a role, with an optional
/// orchestrator-shaped payload for `process_task`
#[derive(Clone)]
pub struct AgentTask {
    pub role: AgentRole,
    pub agent: Arc<dyn Agent>,
    pub payload: Option<Value>,
}

impl AgentTask {
    pub fn new(role: AgentRole, agent: Arc<dyn Agent>) -> Self {
        Self { role, agent, payload: None }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl std::fmt::Debug for AgentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTask")
            .field("role", &self.role)
            .field("agent", &self.agent.name())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

pub struct ParallelExecutor {
    max_concurrent: usize,
}

/// Aborts still-running agent tasks when a fan-out is dropped before its
/// join, e.g. by an enclosing timeout. Finished tasks are unaffected.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

impl ParallelExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run every task concurrently and wait for all of them.
    ///
    /// Returns exactly one result per task, in input order. At most
    /// `max_concurrent` tasks of this call run at once; permits are never
    /// shared with other calls, so concurrent queries do not wait on each
    /// other. The timeout bounds each agent call individually and starts
    /// once the task holds a permit.
    pub async fn run_parallel(
        &self,
        tasks: Vec<AgentTask>,
        context: Arc<QueryContext>,
        per_task_timeout: Duration,
    ) -> Vec<AgentResult> {
        let roles: Vec<AgentRole> = tasks.iter().map(|t| t.role).collect();
        debug!(trace_id = %context.trace_id, ?roles, "Fanning out {} agent(s)", tasks.len());

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let semaphore = semaphore.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    invoke(task, context, per_task_timeout).await
                })
            })
            .collect();
        let _abort_on_drop = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let started = Instant::now();
        join_all(handles)
            .await
            .into_iter()
            .zip(roles)
            .map(|(joined, role)| match joined {
                Ok(result) => result,
                Err(e) => {
                    let reason = if e.is_panic() {
                        format!("agent panicked: {}", panic_message(e.into_panic()))
                    } else {
                        "agent task was cancelled".to_string()
                    };
                    warn!(trace_id = %context.trace_id, %role, "{}", reason);
                    AgentResult::failure(reason)
                        .with_execution_time(started.elapsed().as_millis() as u64)
                        .with_role(role)
                }
            })
            .collect()
    }

    /// Run one agent under the same isolation guarantees as a parallel stage
    pub async fn run_single(
        &self,
        task: AgentTask,
        context: Arc<QueryContext>,
        timeout: Duration,
    ) -> AgentResult {
        let role = task.role;
        self.run_parallel(vec![task], context, timeout)
            .await
            .pop()
            .unwrap_or_else(|| AgentResult::failure("agent produced no result").with_role(role))
    }
}

async fn invoke(task: AgentTask, context: Arc<QueryContext>, limit: Duration) -> AgentResult {
    let start = Instant::now();
    let call = async {
        match &task.payload {
            Some(payload) => task.agent.process_task(payload, &context).await,
            None => task.agent.execute(&context).await,
        }
    };

    let outcome = tokio::time::timeout(limit, call).await;
    let elapsed = start.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(Ok(result)) => result.normalized(),
        Ok(Err(AgentError::Timeout(_))) | Err(_) => {
            warn!(
                trace_id = %context.trace_id,
                role = %task.role,
                agent = task.agent.name(),
                "Agent timed out after {}ms", elapsed
            );
            AgentResult::timeout(elapsed)
        }
        Ok(Err(e)) => {
            warn!(trace_id = %context.trace_id, role = %task.role, "Agent {} failed: {}", task.agent.name(), e);
            AgentResult::failure(e.to_string())
        }
    };

    result
        .with_execution_time(elapsed)
        .with_role(task.role)
        .with_metadata("agent", task.agent.name())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;

    enum Behavior {
        Succeed(f64),
        SleepThenSucceed(u64),
        Hang,
        Fail,
        Error,
        Panic,
    }

    struct ScriptedAgent(Behavior);

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, ctx: &QueryContext) -> Result<AgentResult> {
            match self.0 {
                Behavior::Succeed(c) => Ok(AgentResult::success(json!({"query": ctx.query()}), c)),
                Behavior::SleepThenSucceed(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(AgentResult::success(json!({"slept": ms}), 0.9))
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(AgentResult::success(json!("too late"), 1.0))
                }
                Behavior::Fail => Ok(AgentResult::failure("nothing found")),
                Behavior::Error => Err(AgentError::Execution("backend unreachable".into())),
                Behavior::Panic => panic!("index out of range"),
            }
        }

        async fn process_task(&self, task: &Value, _ctx: &QueryContext) -> Result<AgentResult> {
            Ok(AgentResult::success(task.clone(), 0.5))
        }
    }

    fn task(role: AgentRole, b: Behavior) -> AgentTask {
        AgentTask::new(role, Arc::new(ScriptedAgent(b)))
    }

    #[tokio::test]
    async fn test_results_match_input_order_and_length() {
        tokio::time::pause();
        let executor = ParallelExecutor::new(4);
        let ctx = QueryContext::new("q").snapshot();
        let tasks = vec![
            task(AgentRole::Retrieval, Behavior::SleepThenSucceed(300)),
            task(AgentRole::KnowledgeGraph, Behavior::Fail),
            task(AgentRole::Browser, Behavior::SleepThenSucceed(10)),
            task(AgentRole::Database, Behavior::Error),
            task(AgentRole::Pdf, Behavior::Hang),
        ];

        let results = executor.run_parallel(tasks, ctx, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 5);
        let roles: Vec<_> = results.iter().map(|r| r.role().unwrap()).collect();
        assert_eq!(
            roles,
            vec![AgentRole::Retrieval, AgentRole::KnowledgeGraph, AgentRole::Browser, AgentRole::Database, AgentRole::Pdf]
        );
        assert_eq!(results[0].data, json!({"slept": 300}));
        assert!(!results[1].success);
        assert_eq!(results[2].data, json!({"slept": 10}));
        assert_eq!(results[3].error.as_deref(), Some("agent execution failed: backend unreachable"));
        assert!(results[4].is_timeout());
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_the_hanging_task() {
        tokio::time::pause();
        let executor = ParallelExecutor::new(4);
        let ctx = QueryContext::new("q").snapshot();
        let tasks = vec![
            task(AgentRole::Retrieval, Behavior::Hang),
            task(AgentRole::KnowledgeGraph, Behavior::Succeed(0.8)),
        ];

        let results = executor.run_parallel(tasks, ctx, Duration::from_millis(500)).await;
        assert!(results[0].is_timeout());
        assert_eq!(results[0].error.as_deref(), Some("timed out"));
        assert!(results[0].execution_time_ms >= 500);
        assert!(results[1].success);
        assert_eq!(results[1].confidence, 0.8);
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_result() {
        let executor = ParallelExecutor::default();
        let ctx = QueryContext::new("q").snapshot();
        let results = executor
            .run_parallel(
                vec![task(AgentRole::Synthesis, Behavior::Panic), task(AgentRole::Citation, Behavior::Succeed(0.6))],
                ctx,
                Duration::from_secs(5),
            )
            .await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("index out of range"));
        assert_eq!(results[0].role(), Some(AgentRole::Synthesis));
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn test_failed_results_carry_zero_confidence_and_error() {
        let executor = ParallelExecutor::default();
        let ctx = QueryContext::new("q").snapshot();
        let result = executor
            .run_single(task(AgentRole::Retrieval, Behavior::Error), ctx, Duration::from_secs(1))
            .await;
        assert!(!result.success);
        assert_eq!(result.data, Value::Null);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_payload_routes_to_process_task() {
        let executor = ParallelExecutor::default();
        let ctx = QueryContext::new("q").snapshot();
        let t = task(AgentRole::Citation, Behavior::Fail).with_payload(json!({"answer": "x"}));
        let result = executor.run_single(t, ctx, Duration::from_secs(1)).await;
        assert!(result.success);
        assert_eq!(result.data, json!({"answer": "x"}));
    }

    #[tokio::test]
    async fn test_concurrency_limit_still_completes_all() {
        tokio::time::pause();
        let executor = ParallelExecutor::new(1);
        let ctx = QueryContext::new("q").snapshot();
        let tasks = (0..3).map(|_| task(AgentRole::Retrieval, Behavior::SleepThenSucceed(100))).collect();
        let results = executor.run_parallel(tasks, ctx, Duration::from_millis(150)).await;
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_concurrent_fan_outs_do_not_share_permits() {
        tokio::time::pause();
        let executor = Arc::new(ParallelExecutor::new(2));

        let slow = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let tasks = (0..4).map(|_| task(AgentRole::Retrieval, Behavior::SleepThenSucceed(2000))).collect();
                executor.run_parallel(tasks, QueryContext::new("slow").snapshot(), Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let fast = executor
            .run_single(task(AgentRole::Retrieval, Behavior::Succeed(0.9)), QueryContext::new("fast").snapshot(), Duration::from_secs(5))
            .await;
        assert!(fast.success);
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(slow.await.unwrap().iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_dropped_fan_out_aborts_its_agents() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Flagging(Arc<AtomicBool>);

        #[async_trait]
        impl Agent for Flagging {
            fn name(&self) -> &str {
                "flagging"
            }
            async fn execute(&self, _ctx: &QueryContext) -> Result<AgentResult> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.0.store(true, Ordering::SeqCst);
                Ok(AgentResult::success(json!(null), 1.0))
            }
        }

        tokio::time::pause();
        let finished = Arc::new(AtomicBool::new(false));
        let executor = ParallelExecutor::new(2);
        let fan_out = executor.run_parallel(
            vec![AgentTask::new(AgentRole::Retrieval, Arc::new(Flagging(finished.clone())))],
            QueryContext::new("q").snapshot(),
            Duration::from_secs(60),
        );
        assert!(tokio::time::timeout(Duration::from_secs(1), fan_out).await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
