//! Deadline-ordered delayed batching
//!
//! An alternative to the immediate per-query dispatcher: queries accumulate
//! in per-session queues ordered by deadline, and a single worker turns them
//! into multi-query batch plans whenever something arrives. Serializing the
//! re-plan on one worker keeps the pass simple even though enqueues arrive
//! concurrently.
//!
//! The pass itself works earliest-deadline-first: for each session it picks
//! the backend that can start soonest, grows the batch up to the instance
//! limit, then shrinks it until the head query's deadline is met. A query
//! whose deadline cannot be met even alone is still forwarded; dropping is
//! the backend's call.

use nexus_core::rate::{EwmaRate, IntervalCounter};
use nexus_core::time::unix_now_ns;
use nexus_core::wire::BatchPlan;
use nexus_core::{
    BackendInfo, DispatcherConfig, GlobalId, ModelProfile, ModelSession, NodeId, PlanId,
    ProfileDatabase, Query, Result,
};
use nexus_scheduler::handles::BackendHandle;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const COUNT_INTERVAL_SEC: u64 = 1;
const AVG_INTERVAL_SEC: u64 = 5;

/// A queued query with its precomputed deadline
struct QueryContext {
    query: Query,
    deadline_ns: i64,
}

impl PartialEq for QueryContext {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.query.global_id == other.query.global_id
    }
}

impl Eq for QueryContext {}

impl PartialOrd for QueryContext {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryContext {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first
        other
            .deadline_ns
            .cmp(&self.deadline_ns)
            .then(other.query.global_id.cmp(&self.query.global_id))
    }
}

/// Batch plan parameters of one (backend, session) pair
struct InstancePlan {
    max_batch: u32,
    profile: Arc<dyn ModelProfile>,
}

struct ModelQueue {
    session: ModelSession,
    instances: HashMap<NodeId, InstancePlan>,
    /// Earliest deadline at the top
    sorted_queries: BinaryHeap<QueryContext>,
    req_counter: IntervalCounter,
    req_rate: EwmaRate,
}

struct BackendContext {
    info: BackendInfo,
    handle: Arc<dyn BackendHandle>,
    next_available_time_ns: i64,
}

#[derive(Default)]
struct DelayedState {
    models: HashMap<String, ModelQueue>,
    backends: HashMap<NodeId, BackendContext>,
    queued: HashSet<GlobalId>,
}

enum Task {
    FullSchedule,
}

/// The delayed scheduler variant.
pub struct DelayedScheduler {
    config: DispatcherConfig,
    profiles: Arc<dyn ProfileDatabase>,
    state: Mutex<DelayedState>,
    task_tx: mpsc::UnboundedSender<Task>,
    task_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    next_plan_id: AtomicU64,
}

impl DelayedScheduler {
    pub fn new(config: DispatcherConfig, profiles: Arc<dyn ProfileDatabase>) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        Self {
            config,
            profiles,
            state: Mutex::new(DelayedState::default()),
            task_tx,
            task_rx: Mutex::new(Some(task_rx)),
            next_plan_id: AtomicU64::new(1),
        }
    }

    /// Consume scheduling tasks until all enqueue handles are gone.
    /// Run exactly once, on its own task.
    pub async fn run_worker(&self) {
        let Some(mut task_rx) = self.task_rx.lock().take() else {
            error!("Delayed scheduler worker started twice");
            return;
        };
        while let Some(task) = task_rx.recv().await {
            match task {
                Task::FullSchedule => self.work_full_schedule(),
            }
        }
    }

    pub fn add_model_session(&self, session: ModelSession) {
        let mut state = self.state.lock();
        let session_id = session.to_string();
        if state.models.contains_key(&session_id) {
            error!(session = %session_id, "Model session already exists");
            return;
        }
        let mut queue = ModelQueue {
            session: session.clone(),
            instances: HashMap::new(),
            sorted_queries: BinaryHeap::new(),
            req_counter: IntervalCounter::new(),
            req_rate: EwmaRate::new(COUNT_INTERVAL_SEC, AVG_INTERVAL_SEC),
        };
        for (node_id, backend) in &state.backends {
            if let Some(plan) = self.instance_plan(&backend.info, &session) {
                queue.instances.insert(*node_id, plan);
            }
        }
        state.models.insert(session_id, queue);
    }

    pub fn add_backend(&self, info: BackendInfo, handle: Arc<dyn BackendHandle>) {
        let mut state = self.state.lock();
        let node_id = info.node_id;
        if state.backends.contains_key(&node_id) {
            error!(backend_id = %node_id, "Backend already exists");
            return;
        }
        for queue in state.models.values_mut() {
            if let Some(plan) = self.instance_plan(&info, &queue.session) {
                queue.instances.insert(node_id, plan);
            }
        }
        state.backends.insert(
            node_id,
            BackendContext {
                info,
                handle,
                next_available_time_ns: 0,
            },
        );
    }

    pub fn remove_backend(&self, node_id: NodeId) {
        let mut state = self.state.lock();
        state.backends.remove(&node_id);
        for queue in state.models.values_mut() {
            queue.instances.remove(&node_id);
        }
    }

    /// Queue a query for delayed batching and poke the worker
    pub fn enqueue_query(&self, query: Query) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(queue) = state.models.get_mut(&query.model_session_id) else {
                return Err(nexus_core::Error::model_not_found(
                    query.model_session_id.clone(),
                ));
            };
            let deadline_ns = query.deadline_ns(&queue.session);
            if state.queued.contains(&query.global_id) {
                return Err(nexus_core::Error::internal(format!(
                    "query already queued: {}",
                    query.global_id
                )));
            }
            let global_id = query.global_id;
            queue.req_counter.increase();
            queue.sorted_queries.push(QueryContext { deadline_ns, query });
            state.queued.insert(global_id);
        }
        // Trigger a full schedule on the worker
        let _ = self.task_tx.send(Task::FullSchedule);
        Ok(())
    }

    /// One serialized re-plan pass over every session queue
    pub fn work_full_schedule(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let now = unix_now_ns();
        let budget_ns = self.config.network_latency_budget_us as i64 * 1000;

        let DelayedState {
            models,
            backends,
            queued,
        } = state;

        for (session_id, queue) in models.iter_mut() {
            loop {
                let Some(head) = queue.sorted_queries.peek() else {
                    break;
                };
                let head_deadline = head.deadline_ns;

                // Backend that can start the soonest
                let mut best: Option<(NodeId, i64)> = None;
                for node_id in queue.instances.keys() {
                    let Some(backend) = backends.get(node_id) else {
                        continue;
                    };
                    let start = (now + budget_ns).max(backend.next_available_time_ns);
                    if best.map_or(true, |(_, s)| start < s) {
                        best = Some((*node_id, start));
                    }
                }
                let Some((node_id, start)) = best else {
                    debug!(session = %session_id, "No backend for queued session");
                    break;
                };
                let plan = &queue.instances[&node_id];

                // Grow to the instance limit, then shrink until the head
                // query's deadline holds. A hopeless query still goes out
                // at batch 1.
                let mut batch = (queue.sorted_queries.len() as u32).min(plan.max_batch).max(1);
                while batch > 1
                    && start + (plan.profile.forward_latency_us(batch) * 1000.0) as i64
                        > head_deadline
                {
                    batch -= 1;
                }

                let dispatch_ns = unix_now_ns();
                let mut queries = Vec::with_capacity(batch as usize);
                let mut deadline_ns = i64::MAX;
                for _ in 0..batch {
                    let Some(mut ctx) = queue.sorted_queries.pop() else {
                        break;
                    };
                    queued.remove(&ctx.query.global_id);
                    deadline_ns = deadline_ns.min(ctx.deadline_ns);
                    ctx.query.clock.dispatcher_dispatch_ns = dispatch_ns;
                    queries.push(ctx.query);
                }

                let forward_ns =
                    (plan.profile.forward_latency_us(queries.len() as u32) * 1000.0) as i64;
                let expected_finish_time_ns = start + forward_ns;
                let batch_plan = BatchPlan {
                    plan_id: PlanId::new(self.next_plan_id.fetch_add(1, Ordering::Relaxed)),
                    model_session_id: session_id.clone(),
                    queries_without_input: queries,
                    exec_time_ns: start,
                    deadline_ns,
                    expected_finish_time_ns,
                };
                let Some(backend) = backends.get_mut(&node_id) else {
                    continue;
                };
                backend.next_available_time_ns = expected_finish_time_ns;
                if let Err(err) = backend.handle.enqueue_batch_plan(batch_plan) {
                    warn!(
                        backend_id = %node_id,
                        error = %err,
                        "Failed to enqueue delayed batch plan"
                    );
                }
            }
        }
    }

    /// Smoothed request rate of one session, folding in the counts since
    /// the last call
    pub fn request_rate(&self, session_id: &str) -> Option<f64> {
        let mut state = self.state.lock();
        let queue = state.models.get_mut(session_id)?;
        let count = queue.req_counter.drain();
        if queue.req_rate.rate() >= 0.0 || count > 0 {
            queue.req_rate.add_sample(count);
        }
        Some(queue.req_rate.rate())
    }

    pub fn pending_queries(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .models
            .get(session_id)
            .map_or(0, |queue| queue.sorted_queries.len())
    }

    pub fn backend_next_available(&self, node_id: NodeId) -> Option<i64> {
        self.state
            .lock()
            .backends
            .get(&node_id)
            .map(|backend| backend.next_available_time_ns)
    }

    fn instance_plan(&self, info: &BackendInfo, session: &ModelSession) -> Option<InstancePlan> {
        let profile = self
            .profiles
            .profile(&info.gpu_device, &info.gpu_uuid, session)?;
        let max_batch = profile.max_batch_with_full_budget(session.latency_sla_us);
        if max_batch == 0 {
            return None;
        }
        Some(InstancePlan { max_batch, profile })
    }
}
