//! Workflow Engine
//!
//! A small dataflow runtime composing executors into a directed graph with
//! typed edges. The scheduler advances in supersteps: every executor with
//! ready input envelopes runs concurrently within the step, and their sends
//! become the next step's inputs. A bounded superstep count turns graph
//! cycles (the dynamic workflow's replan loop) into bounded loops instead
//! of errors.
//!
//! Executors have three output channels: messages to downstream executors,
//! yielded output (the workflow's final value), and incremental updates
//! tagged with the executor id and a monotonically increasing sequence.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::utils::error::{AppError, AppResult};

/// Default bound on supersteps per run
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Marker for payload types carried along edges
pub trait WorkflowMessage: Clone + Send + Sync + Debug + 'static {}
impl<T: Clone + Send + Sync + Debug + 'static> WorkflowMessage for T {}

/// The message carried along an edge
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    pub payload: M,
    /// Executor that produced this envelope (empty for the workflow input)
    pub source: String,
    /// Superstep at which the envelope was emitted; rises through loop edges
    pub iteration: u32,
    /// Fan-in cardinality attached by the dispatcher
    pub expected_responses: Option<usize>,
}

/// Events surfaced by a running workflow
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    ExecutorInvoked { executor_id: String },
    ExecutorCompleted { executor_id: String },
    ExecutorFailed { executor_id: String, error: String },
    /// Incremental text from an executor, in emission order
    AgentRunUpdate {
        executor_id: String,
        text: String,
        seq: u64,
    },
    WorkflowStatus { message: String },
    /// A terminal value yielded by an executor
    WorkflowOutput { text: String },
    WorkflowFailed { error: String },
}

struct Outbound<M> {
    payload: M,
    expected_responses: Option<usize>,
}

/// Per-invocation handle an executor uses to talk to the engine.
pub struct ExecutorContext<M> {
    executor_id: String,
    /// Highest iteration among the triggering envelopes
    iteration: u32,
    sent: Mutex<Vec<Outbound<M>>>,
    events: mpsc::Sender<WorkflowEvent>,
    update_seq: Arc<AtomicU64>,
    state: Arc<RwLock<HashMap<String, Value>>>,
    cancel: CancellationToken,
}

impl<M: WorkflowMessage> ExecutorContext<M> {
    /// Send a message along this executor's outgoing edges.
    pub async fn send_message(&self, payload: M) {
        self.sent.lock().await.push(Outbound {
            payload,
            expected_responses: None,
        });
    }

    /// Send a message annotated with the fan-in cardinality downstream
    /// aggregators should wait for.
    pub async fn send_message_expecting(&self, payload: M, expected_responses: usize) {
        self.sent.lock().await.push(Outbound {
            payload,
            expected_responses: Some(expected_responses),
        });
    }

    /// Yield a terminal value for the workflow run.
    pub async fn yield_output(&self, text: impl Into<String>) {
        let _ = self
            .events
            .send(WorkflowEvent::WorkflowOutput { text: text.into() })
            .await;
    }

    /// Publish an incremental text update, tagged with this executor's id
    /// and the run-wide update sequence.
    pub async fn emit_update(&self, text: impl Into<String>) {
        let seq = self.update_seq.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .events
            .send(WorkflowEvent::AgentRunUpdate {
                executor_id: self.executor_id.clone(),
                text: text.into(),
                seq,
            })
            .await;
    }

    /// Store a shared-state value visible to all executors of this run.
    pub async fn set_state<T: Serialize>(&self, key: &str, value: &T) {
        let json = serde_json::to_value(value).unwrap_or(Value::Null);
        self.state.write().await.insert(key.to_string(), json);
    }

    /// Read a shared-state value.
    pub async fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let state = self.state.read().await;
        state
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A node in the workflow graph.
#[async_trait]
pub trait Executor<M: WorkflowMessage>: Send + Sync {
    /// Stable, addressable identifier
    fn id(&self) -> &str;

    /// Whether this executor's incremental updates are user-visible
    /// (`output_response` in the UI contract)
    fn streams_output(&self) -> bool {
        false
    }

    /// Whether this executor yields the workflow's final value on at least
    /// one of its paths. Required for streaming executors.
    fn yields_output(&self) -> bool {
        false
    }

    /// Fan-in executors are released only once the expected number of
    /// envelopes has arrived.
    fn fan_in(&self) -> bool {
        false
    }

    /// Process the ready envelopes. Non-fan-in executors usually receive a
    /// single envelope; batched deliveries within one superstep arrive
    /// together.
    async fn handle(&self, inputs: Vec<Envelope<M>>, ctx: &ExecutorContext<M>) -> AppResult<()>;
}

/// Selection predicate: inspects a payload and picks target executor ids.
pub type Selector<M> = Arc<dyn Fn(&M, &[String]) -> Vec<String> + Send + Sync>;

struct EdgeGroup<M> {
    source: String,
    targets: Vec<String>,
    selector: Option<Selector<M>>,
}

/// Builder assembling executors and edges into a validated [`Workflow`].
pub struct WorkflowBuilder<M: WorkflowMessage> {
    name: String,
    executors: HashMap<String, Arc<dyn Executor<M>>>,
    edges: Vec<EdgeGroup<M>>,
    start: Option<String>,
    max_iterations: u32,
}

impl<M: WorkflowMessage> WorkflowBuilder<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executors: HashMap::new(),
            edges: Vec::new(),
            start: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn max_iterations(mut self, bound: u32) -> Self {
        self.max_iterations = bound;
        self
    }

    fn register(&mut self, executor: &Arc<dyn Executor<M>>) {
        self.executors
            .entry(executor.id().to_string())
            .or_insert_with(|| Arc::clone(executor));
    }

    pub fn set_start_executor(mut self, executor: Arc<dyn Executor<M>>) -> Self {
        self.start = Some(executor.id().to_string());
        self.register(&executor);
        self
    }

    /// Plain edge: the special case of a selector returning the single target.
    pub fn add_edge(
        mut self,
        source: &Arc<dyn Executor<M>>,
        target: &Arc<dyn Executor<M>>,
    ) -> Self {
        self.register(source);
        self.register(target);
        self.edges.push(EdgeGroup {
            source: source.id().to_string(),
            targets: vec![target.id().to_string()],
            selector: None,
        });
        self
    }

    /// Conditional branch / fan-out: the selector picks any subset of
    /// targets for each message.
    pub fn add_multi_selection_edge_group(
        mut self,
        source: &Arc<dyn Executor<M>>,
        targets: Vec<Arc<dyn Executor<M>>>,
        selector: Selector<M>,
    ) -> Self {
        self.register(source);
        for target in &targets {
            self.register(target);
        }
        self.edges.push(EdgeGroup {
            source: source.id().to_string(),
            targets: targets.iter().map(|t| t.id().to_string()).collect(),
            selector: Some(selector),
        });
        self
    }

    /// Fan-out without selection: every message goes to every target.
    pub fn add_fan_out_edges(
        mut self,
        source: &Arc<dyn Executor<M>>,
        targets: Vec<Arc<dyn Executor<M>>>,
    ) -> Self {
        self.register(source);
        for target in &targets {
            self.register(target);
        }
        self.edges.push(EdgeGroup {
            source: source.id().to_string(),
            targets: targets.iter().map(|t| t.id().to_string()).collect(),
            selector: None,
        });
        self
    }

    /// Fan-in: every source feeds the single collecting target.
    pub fn add_fan_in_edges(
        mut self,
        sources: Vec<Arc<dyn Executor<M>>>,
        target: &Arc<dyn Executor<M>>,
    ) -> Self {
        self.register(target);
        for source in sources {
            self.register(&source);
            self.edges.push(EdgeGroup {
                source: source.id().to_string(),
                targets: vec![target.id().to_string()],
                selector: None,
            });
        }
        self
    }

    /// Validate and build. Streaming executors must also yield output:
    /// a workflow that streams to the UI but never yields would persist a
    /// blank reply, so that shape is rejected at construction time.
    pub fn build(self) -> AppResult<Workflow<M>> {
        let start = self
            .start
            .ok_or_else(|| AppError::internal("workflow has no start executor"))?;

        for edge in &self.edges {
            if !self.executors.contains_key(&edge.source) {
                return Err(AppError::internal(format!(
                    "edge source '{}' is not registered",
                    edge.source
                )));
            }
            for target in &edge.targets {
                if !self.executors.contains_key(target) {
                    return Err(AppError::internal(format!(
                        "edge target '{}' is not registered",
                        target
                    )));
                }
            }
        }

        let mut streaming_ids = HashSet::new();
        for (id, executor) in &self.executors {
            if executor.streams_output() {
                if !executor.yields_output() {
                    return Err(AppError::internal(format!(
                        "streaming executor '{}' does not yield final output",
                        id
                    )));
                }
                streaming_ids.insert(id.clone());
            }
        }

        Ok(Workflow {
            name: self.name,
            executors: self.executors,
            edges: self.edges,
            start,
            max_iterations: self.max_iterations,
            streaming_ids,
        })
    }
}

/// A validated workflow graph, ready to run.
pub struct Workflow<M: WorkflowMessage> {
    name: String,
    executors: HashMap<String, Arc<dyn Executor<M>>>,
    edges: Vec<EdgeGroup<M>>,
    start: String,
    max_iterations: u32,
    streaming_ids: HashSet<String>,
}

impl<M: WorkflowMessage> std::fmt::Debug for Workflow<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("max_iterations", &self.max_iterations)
            .field("streaming_ids", &self.streaming_ids)
            .finish()
    }
}

/// Collected result of a completed run (test and offline convenience).
#[derive(Debug, Default)]
pub struct WorkflowRunResult {
    pub outputs: Vec<String>,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowRunResult {
    pub fn final_output(&self) -> Option<&str> {
        self.outputs.last().map(String::as_str)
    }
}

impl<M: WorkflowMessage> Workflow<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ids of executors whose updates are relayed to clients, discovered by
    /// enumerating the executor set at construction time.
    pub fn streaming_executor_ids(&self) -> &HashSet<String> {
        &self.streaming_ids
    }

    /// Drive the workflow to completion, emitting [`WorkflowEvent`]s live
    /// on `events`. Runs on the calling task so ambient request context
    /// (the event-bus handle) propagates into executors.
    pub async fn run_to_channel(
        &self,
        input: M,
        events: mpsc::Sender<WorkflowEvent>,
        cancel: CancellationToken,
    ) {
        if let Err(err) = self.drive(input, &events, cancel).await {
            let _ = events
                .send(WorkflowEvent::WorkflowFailed {
                    error: err.to_string(),
                })
                .await;
        }
    }

    async fn drive(
        &self,
        input: M,
        events: &mpsc::Sender<WorkflowEvent>,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        let state: Arc<RwLock<HashMap<String, Value>>> = Arc::new(RwLock::new(HashMap::new()));
        let update_seq = Arc::new(AtomicU64::new(0));

        let mut pending: HashMap<String, Vec<Envelope<M>>> = HashMap::new();
        pending.insert(
            self.start.clone(),
            vec![Envelope {
                payload: input,
                source: String::new(),
                iteration: 0,
                expected_responses: None,
            }],
        );

        // Envelopes parked at fan-in executors until their count is met.
        let mut fan_in_parked: HashMap<String, Vec<Envelope<M>>> = HashMap::new();
        let mut superstep: u32 = 0;

        while !pending.is_empty() || !fan_in_parked.is_empty() {
            // Assemble the ready set for this superstep.
            let mut ready: Vec<(Arc<dyn Executor<M>>, Vec<Envelope<M>>)> = Vec::new();
            for (target, envelopes) in pending.drain() {
                let executor = Arc::clone(&self.executors[&target]);
                if executor.fan_in() {
                    let released = {
                        let parked = fan_in_parked.entry(target.clone()).or_default();
                        parked.extend(envelopes);
                        let expected = parked
                            .iter()
                            .find_map(|e| e.expected_responses)
                            .unwrap_or(1);
                        parked.len() >= expected
                    };
                    if released {
                        if let Some(batch) = fan_in_parked.remove(&target) {
                            ready.push((executor, batch));
                        }
                    }
                } else {
                    ready.push((executor, envelopes));
                }
            }

            if ready.is_empty() {
                if fan_in_parked.is_empty() {
                    break;
                }
                return Err(AppError::internal(format!(
                    "workflow '{}' stalled waiting for fan-in responses",
                    self.name
                )));
            }

            if superstep >= self.max_iterations {
                return Err(AppError::IterationLimitExceeded(self.max_iterations));
            }
            superstep += 1;

            let _ = events
                .send(WorkflowEvent::WorkflowStatus {
                    message: format!("superstep {} ({} executors ready)", superstep, ready.len()),
                })
                .await;

            // Run all ready executors concurrently. The first failure
            // cancels its superstep peers.
            let step_futures = ready.into_iter().map(|(executor, envelopes)| {
                let events = events.clone();
                let state = Arc::clone(&state);
                let update_seq = Arc::clone(&update_seq);
                let cancel = cancel.clone();
                async move {
                    let id = executor.id().to_string();
                    let _ = events
                        .send(WorkflowEvent::ExecutorInvoked {
                            executor_id: id.clone(),
                        })
                        .await;

                    let ctx = ExecutorContext {
                        executor_id: id.clone(),
                        iteration: envelopes.iter().map(|e| e.iteration).max().unwrap_or(0),
                        sent: Mutex::new(Vec::new()),
                        events: events.clone(),
                        update_seq,
                        state,
                        cancel: cancel.clone(),
                    };

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => Err(AppError::Timeout("workflow cancelled".into())),
                        result = executor.handle(envelopes, &ctx) => result,
                    };

                    match outcome {
                        Ok(()) => {
                            let _ = events
                                .send(WorkflowEvent::ExecutorCompleted {
                                    executor_id: id.clone(),
                                })
                                .await;
                            Ok((id, ctx.sent.into_inner()))
                        }
                        Err(err) => {
                            let _ = events
                                .send(WorkflowEvent::ExecutorFailed {
                                    executor_id: id.clone(),
                                    error: err.to_string(),
                                })
                                .await;
                            Err(err)
                        }
                    }
                }
            });

            let completed = try_join_all(step_futures).await?;

            // Route this superstep's sends to the next one.
            for (source, outbound) in completed {
                for message in outbound {
                    for edge in self.edges.iter().filter(|e| e.source == source) {
                        let selected = match &edge.selector {
                            Some(selector) => selector(&message.payload, &edge.targets),
                            None => edge.targets.clone(),
                        };
                        for target in selected {
                            if !self.executors.contains_key(&target) {
                                tracing::warn!(
                                    "selector chose unknown executor '{}' from '{}'",
                                    target,
                                    source
                                );
                                continue;
                            }
                            pending.entry(target).or_default().push(Envelope {
                                payload: message.payload.clone(),
                                source: source.clone(),
                                iteration: superstep,
                                expected_responses: message.expected_responses,
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Run to completion, collecting outputs and events.
    pub async fn run_collect(&self, input: M) -> WorkflowRunResult {
        let (tx, mut rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();

        let mut result = WorkflowRunResult::default();
        let drive = self.run_to_channel(input, tx, cancel);
        tokio::pin!(drive);
        let mut driving = true;
        loop {
            tokio::select! {
                _ = &mut drive, if driving => driving = false,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let WorkflowEvent::WorkflowOutput { text } = &event {
                            result.outputs.push(text.clone());
                        }
                        result.events.push(event);
                    }
                    // The sender is dropped once driving finishes; a None
                    // here means every event has been drained.
                    None => break,
                },
            }
        }
        result
    }
}
