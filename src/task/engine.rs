//! Task Runner - staged workflow execution
//!
//! Drives task records through their workflow stages:
//! - At most one stage dispatch per task; wake-ups are queued FIFO
//! - Wake-ups for a stage the task has already left are dropped
//! - Terminal outcomes wait for every tracked child to finish
//! - Quota reservations are resolved exactly once at the terminal status
//! - Parents are notified of child outcomes by message, never by polling
//! - Unfinished records are resumed from their persisted stage on restart

use crate::domain::ports::{Credential, ResourceRef};
use crate::error::{Error, Result};
use crate::quota::{QuotaLedger, QuotaLedgerRef, Reservation, ReservationState, Resolution};
use crate::task::metrics::EngineMetrics;
use crate::task::record::{
    NewTask, StageTransition, TaskError, TaskId, TaskParams, TaskRecord, TaskStatus,
};
use crate::task::store::{MemoryTaskStore, TaskStoreRef};
use crate::task::workflow::{ErasedWorkflow, StageInput, Workflow, WorkflowHandler, WorkflowStage};
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the task engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the task event channel
    pub event_capacity: usize,
    /// Resume unfinished records at startup
    pub resume_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            resume_on_start: true,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted as tasks progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        task_id: TaskId,
        workflow: String,
        parent_id: Option<TaskId>,
    },
    StageChanged {
        task_id: TaskId,
        from: String,
        to: String,
    },
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Created { task_id, .. } => task_id,
            TaskEvent::StageChanged { task_id, .. } => task_id,
            TaskEvent::StatusChanged { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::StatusChanged { status, .. } if status.is_terminal())
    }
}

/// Summary of a `resume` pass
#[derive(Debug, Clone, Default)]
pub struct ResumeReport {
    /// Re-dispatched from their persisted stage
    pub resumed: Vec<TaskId>,
    /// Failed because their stage cannot be re-entered
    pub interrupted: Vec<TaskId>,
    /// Parked until their unfinished children report
    pub waiting: usize,
}

// =============================================================================
// Task Slot
// =============================================================================

#[derive(Debug, Clone)]
enum Outcome {
    Complete(Option<Value>),
    Failed(TaskError),
}

/// A wake-up stamped with the stage the task was in when it arrived
struct Queued {
    stage: String,
    input: StageInput,
}

impl Queued {
    fn is_completion(&self) -> bool {
        matches!(self.input, StageInput::ChildCompleted { .. })
    }

    fn is_child_failure(&self) -> bool {
        matches!(self.input, StageInput::Failed { child: Some(_), .. })
    }
}

#[derive(Default)]
struct DispatchQueue {
    running: bool,
    inputs: VecDeque<Queued>,
}

impl DispatchQueue {
    /// Child failures overtake sibling completions queued for the same stage
    fn push(&mut self, queued: Queued) {
        if queued.is_child_failure() {
            let at = self
                .inputs
                .iter()
                .position(|q| q.is_completion() && q.stage == queued.stage);
            if let Some(at) = at {
                self.inputs.insert(at, queued);
                return;
            }
        }
        self.inputs.push_back(queued);
    }
}

/// In-memory state of one known task
struct TaskSlot {
    record: Mutex<TaskRecord>,
    queue: Mutex<DispatchQueue>,
    /// Children that have not reached a terminal status
    children: Mutex<BTreeSet<TaskId>>,
    /// Outcome waiting for `children` to drain
    deferred: Mutex<Option<Outcome>>,
    status: watch::Sender<TaskStatus>,
}

impl TaskSlot {
    fn new(record: TaskRecord) -> Arc<Self> {
        let (status, _) = watch::channel(record.status);
        Arc::new(Self {
            record: Mutex::new(record),
            queue: Mutex::new(DispatchQueue::default()),
            children: Mutex::new(BTreeSet::new()),
            deferred: Mutex::new(None),
            status,
        })
    }

    fn id(&self) -> TaskId {
        self.record.lock().id.clone()
    }

    fn snapshot(&self) -> TaskRecord {
        self.record.lock().clone()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Registration phase of the engine
pub struct TaskEngineBuilder {
    workflows: IndexMap<String, Box<dyn ErasedWorkflow>>,
    store: Option<TaskStoreRef>,
    quota: Option<QuotaLedgerRef>,
    config: EngineConfig,
}

impl Default for TaskEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEngineBuilder {
    pub fn new() -> Self {
        Self {
            workflows: IndexMap::new(),
            store: None,
            quota: None,
            config: EngineConfig::default(),
        }
    }

    /// Register a workflow; duplicate names are a programming error
    pub fn register<H: WorkflowHandler>(&mut self, name: &str, handler: H) -> &mut Self {
        if self.workflows.contains_key(name) {
            panic!("workflow {} registered twice", name);
        }

        let workflow = Workflow::new(name.to_string(), handler);
        debug!(
            workflow = name,
            stages = ?workflow.stage_names(),
            "Registered workflow"
        );
        self.workflows.insert(name.to_string(), Box::new(workflow));
        self
    }

    pub fn workflow<H: WorkflowHandler>(mut self, name: &str, handler: H) -> Self {
        self.register(name, handler);
        self
    }

    pub fn store(mut self, store: TaskStoreRef) -> Self {
        self.store = Some(store);
        self
    }

    pub fn quota(mut self, quota: QuotaLedgerRef) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TaskEngine> {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        info!(
            workflows = self.workflows.len(),
            "Task engine initialized"
        );

        Ok(TaskEngine {
            inner: Arc::new(EngineInner {
                workflows: self.workflows,
                slots: DashMap::new(),
                store: self
                    .store
                    .unwrap_or_else(|| MemoryTaskStore::new() as TaskStoreRef),
                quota: self.quota.unwrap_or_else(QuotaLedger::new),
                events,
                metrics: EngineMetrics::new()?,
                config: self.config,
            }),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineInner {
    workflows: IndexMap<String, Box<dyn ErasedWorkflow>>,
    slots: DashMap<TaskId, Arc<TaskSlot>>,
    store: TaskStoreRef,
    quota: QuotaLedgerRef,
    events: broadcast::Sender<TaskEvent>,
    metrics: EngineMetrics,
    config: EngineConfig,
}

/// The task runner; cheap to clone
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn builder() -> TaskEngineBuilder {
        TaskEngineBuilder::new()
    }

    pub fn quota(&self) -> &QuotaLedgerRef {
        &self.inner.quota
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Registered workflow names in registration order
    pub fn workflows(&self) -> Vec<&str> {
        self.inner.workflows.keys().map(String::as_str).collect()
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.inner.workflows.contains_key(name)
    }

    /// Declared stages of a workflow
    pub fn stages(&self, workflow: &str) -> Option<Vec<&'static str>> {
        self.inner.workflows.get(workflow).map(|w| w.stage_names())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Task creation
    // -------------------------------------------------------------------------

    /// Create and persist a task at its init stage without scheduling it
    pub async fn new_task(&self, request: NewTask) -> Result<TaskHandle> {
        let workflow = self.inner.workflows.get(&request.workflow).ok_or_else(|| {
            Error::UnknownWorkflow {
                workflow: request.workflow.clone(),
            }
        })?;

        let id = TaskId::generate();

        // The parent must be live; tracking starts before the child can finish
        let parent = match &request.parent_id {
            Some(parent_id) => {
                let parent = self.slot(parent_id)?;
                {
                    let mut children = parent.children.lock();
                    let record = parent.record.lock();
                    if record.is_terminal() {
                        return Err(Error::TaskTerminal {
                            task_id: parent_id.to_string(),
                            status: record.status.to_string(),
                        });
                    }
                    children.insert(id.clone());
                }
                Some(parent)
            }
            None => None,
        };

        let record = TaskRecord::new(id.clone(), request, workflow.init_stage());
        if let Err(e) = self.persist(&record).await {
            if let Some(parent) = &parent {
                parent.children.lock().remove(&id);
            }
            return Err(e);
        }

        self.inner.slots.insert(id.clone(), TaskSlot::new(record.clone()));
        self.inner
            .metrics
            .tasks_created
            .with_label_values(&[&record.name])
            .inc();
        self.inner.metrics.active_tasks.inc();
        self.emit(TaskEvent::Created {
            task_id: id.clone(),
            workflow: record.name.clone(),
            parent_id: record.parent_id.clone(),
        });

        info!(
            task_id = %id,
            workflow = %record.name,
            target = %record.target,
            parent_id = ?record.parent_id.as_ref().map(TaskId::as_str),
            "Created task"
        );

        Ok(TaskHandle {
            engine: self.clone(),
            id,
        })
    }

    /// Create a task and schedule its first stage
    pub async fn start(&self, request: NewTask) -> Result<TaskHandle> {
        let handle = self.new_task(request).await?;
        handle.schedule_run(None)?;
        Ok(handle)
    }

    /// Handle to a task known to this process
    pub fn handle(&self, id: &TaskId) -> Result<TaskHandle> {
        self.slot(id)?;
        Ok(TaskHandle {
            engine: self.clone(),
            id: id.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get(&self, id: &TaskId) -> Result<TaskRecord> {
        if let Ok(slot) = self.slot(id) {
            return Ok(slot.snapshot());
        }
        self.inner
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    /// All records, oldest first
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let mut records: BTreeMap<TaskId, TaskRecord> = self
            .inner
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        // Live slots are at least as fresh as the store
        for entry in self.inner.slots.iter() {
            let record = entry.value().snapshot();
            records.insert(record.id.clone(), record);
        }

        let mut records: Vec<_> = records.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub async fn children(&self, id: &TaskId) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.parent_id.as_ref() == Some(id))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Flag a task and its descendants; honored at the next stage boundary
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        let root = self.slot(id)?;
        {
            let record = root.record.lock();
            if record.is_terminal() {
                return Err(Error::TaskTerminal {
                    task_id: id.to_string(),
                    status: record.status.to_string(),
                });
            }
        }

        let mut stack = vec![root];
        let mut flagged = Vec::new();
        while let Some(slot) = stack.pop() {
            let children: Vec<TaskId> = slot.children.lock().iter().cloned().collect();
            stack.extend(children.iter().filter_map(|c| self.slot(c).ok()));

            let snapshot = {
                let mut record = slot.record.lock();
                if record.is_terminal() || record.cancelled {
                    continue;
                }
                record.cancelled = true;
                record.updated_at = Utc::now();
                record.clone()
            };
            flagged.push((slot, snapshot));
        }

        for (slot, snapshot) in flagged {
            if let Err(e) = self.persist(&snapshot).await {
                warn!(task_id = %snapshot.id, "Failed to persist cancellation: {}", e);
            }
            info!(task_id = %snapshot.id, "Cancellation requested");
            self.enqueue(slot, StageInput::run());
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Resume
    // -------------------------------------------------------------------------

    /// Adopt unfinished records from the store and continue them
    pub async fn resume(&self) -> Result<ResumeReport> {
        let (finished, unfinished): (Vec<TaskRecord>, Vec<TaskRecord>) = self
            .inner
            .store
            .list()
            .await?
            .into_iter()
            .partition(|r| r.is_terminal());

        let mut adopted = Vec::new();
        for record in unfinished {
            if self.inner.slots.contains_key(&record.id) {
                continue;
            }
            if let Some(reservation) = record.reservation.as_ref().filter(|r| r.is_pending()) {
                self.inner.quota.adopt(reservation);
            }

            let slot = TaskSlot::new(record.clone());
            self.inner.slots.insert(record.id.clone(), slot.clone());
            self.inner.metrics.active_tasks.inc();
            adopted.push(slot);
        }

        for slot in &adopted {
            let parent_id = slot.record.lock().parent_id.clone();
            if let Some(parent) = parent_id.and_then(|p| self.slot(&p).ok()) {
                parent.children.lock().insert(slot.id());
            }
        }

        let mut report = ResumeReport::default();
        for slot in adopted {
            let redelivered = self.redeliver_children(&slot, &finished);
            if !slot.children.lock().is_empty() {
                report.waiting += 1;
                continue;
            }

            let (id, name, stage) = {
                let record = slot.record.lock();
                (record.id.clone(), record.name.clone(), record.stage.clone())
            };
            if redelivered > 0 {
                debug!(task_id = %id, stage = %stage, redelivered, "Resuming task with child outcomes");
                report.resumed.push(id);
                continue;
            }

            let resumable = self
                .inner
                .workflows
                .get(&name)
                .and_then(|w| w.is_resumable(&stage));

            if resumable == Some(false) {
                let err = Error::TaskInterrupted {
                    task_id: id.to_string(),
                    stage: stage.clone(),
                };
                warn!(task_id = %id, stage = %stage, "Stage cannot be resumed");
                self.finalize(&slot, Outcome::Failed(err.into())).await;
                report.interrupted.push(id);
            } else {
                debug!(task_id = %id, stage = %stage, "Resuming task");
                self.enqueue(slot, StageInput::run());
                report.resumed.push(id);
            }
        }

        info!(
            resumed = report.resumed.len(),
            interrupted = report.interrupted.len(),
            waiting = report.waiting,
            "Resumed unfinished tasks"
        );
        Ok(report)
    }

    /// Queue the outcomes of children that finished after `slot` entered its
    /// current stage, oldest first
    fn redeliver_children(&self, slot: &Arc<TaskSlot>, finished: &[TaskRecord]) -> usize {
        let (id, entered) = {
            let record = slot.record.lock();
            let entered = record
                .history
                .last()
                .map(|t| t.at)
                .unwrap_or(record.created_at);
            (record.id.clone(), entered)
        };

        let mut late: Vec<&TaskRecord> = finished
            .iter()
            .filter(|c| c.parent_id.as_ref() == Some(&id) && c.updated_at > entered)
            .collect();
        late.sort_by_key(|c| c.updated_at);

        for child in &late {
            let input = match child.status {
                TaskStatus::Complete => StageInput::ChildCompleted {
                    child: child.id.clone(),
                    result: child.result.clone(),
                },
                _ => StageInput::Failed {
                    error: child.error.clone().unwrap_or_else(|| {
                        TaskError::new("internal", format!("child {} failed", child.id))
                    }),
                    child: Some(child.id.clone()),
                },
            };
            debug!(task_id = %id, child_id = %child.id, status = %child.status, "Redelivering child outcome");
            self.enqueue(slot.clone(), input);
        }
        late.len()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn slot(&self, id: &TaskId) -> Result<Arc<TaskSlot>> {
        self.inner
            .slots
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    fn schedule(&self, id: &TaskId, input: StageInput) -> Result<()> {
        let slot = self.slot(id)?;
        let status = slot.record.lock().status;
        if status.is_terminal() {
            return Err(Error::TaskTerminal {
                task_id: id.to_string(),
                status: status.to_string(),
            });
        }
        self.enqueue(slot, input);
        Ok(())
    }

    fn enqueue(&self, slot: Arc<TaskSlot>, input: StageInput) {
        let stage = slot.record.lock().stage.clone();
        let start = {
            let mut queue = slot.queue.lock();
            queue.push(Queued { stage, input });
            !std::mem::replace(&mut queue.running, true)
        };

        if start {
            let engine = self.clone();
            tokio::spawn(async move { engine.drain(slot).await });
        }
    }

    /// Single consumer of a task's wake-up queue
    async fn drain(self, slot: Arc<TaskSlot>) {
        loop {
            let queued = {
                let mut queue = slot.queue.lock();
                match queue.inputs.pop_front() {
                    Some(queued) => queued,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };
            self.dispatch(&slot, queued).await;
        }
    }

    async fn dispatch(&self, slot: &Arc<TaskSlot>, queued: Queued) {
        let (task_id, workflow_name, stage, status, cancelled) = {
            let record = slot.record.lock();
            (
                record.id.clone(),
                record.name.clone(),
                record.stage.clone(),
                record.status,
                record.cancelled,
            )
        };

        if status.is_terminal() {
            debug!(task_id = %task_id, "Ignoring wake-up of finished task");
            return;
        }

        if slot.deferred.lock().is_some() {
            if slot.children.lock().is_empty() {
                let deferred = slot.deferred.lock().take();
                if let Some(outcome) = deferred {
                    self.finalize(slot, outcome).await;
                }
            }
            return;
        }

        if cancelled {
            info!(task_id = %task_id, stage = %stage, "Task cancelled at stage boundary");
            let err = Error::TaskCancelled {
                task_id: task_id.to_string(),
            };
            self.finalize(slot, Outcome::Failed(err.into())).await;
            return;
        }

        // Failures are delivered wherever the task has moved to
        let Queued { stage: queued_at, input } = queued;
        if queued_at != stage && input.failure().is_none() {
            debug!(
                task_id = %task_id,
                queued_at = %queued_at,
                stage = %stage,
                "Dropping wake-up for a stage the task has left"
            );
            return;
        }

        let Some(workflow) = self.inner.workflows.get(&workflow_name) else {
            let err = Error::UnknownWorkflow {
                workflow: workflow_name.clone(),
            };
            self.finalize(slot, Outcome::Failed(err.into())).await;
            return;
        };

        if status == TaskStatus::Init {
            if let Err(e) = self.mark_running(slot).await {
                self.finalize(slot, Outcome::Failed(e.into())).await;
                return;
            }
        }

        debug!(
            task_id = %task_id,
            workflow = %workflow_name,
            stage = %stage,
            "Dispatching stage"
        );
        self.inner
            .metrics
            .stage_dispatches
            .with_label_values(&[&workflow_name, &stage])
            .inc();
        let started = Instant::now();

        let core = DispatchCore {
            engine: self.clone(),
            slot: slot.clone(),
            input,
            outcome: None,
        };
        let (core, result) = workflow.dispatch(&stage, core).await;

        self.inner
            .metrics
            .stage_duration
            .with_label_values(&[&workflow_name, &stage])
            .observe(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(()) => core.outcome,
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    stage = %stage,
                    error = %e,
                    "Stage handler failed"
                );
                Some(Outcome::Failed(TaskError::from(&e)))
            }
        };

        if let Some(outcome) = outcome {
            self.finalize(slot, outcome).await;
        }
    }

    async fn mark_running(&self, slot: &Arc<TaskSlot>) -> Result<()> {
        let snapshot = {
            let mut record = slot.record.lock();
            record.status = TaskStatus::Running;
            record.updated_at = Utc::now();
            record.clone()
        };
        slot.status.send_replace(TaskStatus::Running);
        self.emit(TaskEvent::StatusChanged {
            task_id: snapshot.id.clone(),
            status: TaskStatus::Running,
        });
        self.persist(&snapshot).await
    }

    async fn finalize(&self, slot: &Arc<TaskSlot>, outcome: Outcome) {
        {
            let children = slot.children.lock();
            if !children.is_empty() {
                debug!(
                    outstanding = children.len(),
                    "Deferring task outcome until children finish"
                );
                *slot.deferred.lock() = Some(outcome);
                return;
            }
        }

        // Settle the reservation before the status becomes observable
        let reservation = slot.record.lock().reservation.clone();
        let mut settled = None;
        if let Some(reservation) = reservation.filter(|r| r.is_pending()) {
            let quota = &self.inner.quota;
            let result = match &outcome {
                Outcome::Complete(_) => quota.commit(&reservation.id),
                Outcome::Failed(_) => quota.cancel(&reservation.id),
            };
            if let Err(e) = result {
                warn!(reservation_id = %reservation.id, "Failed to settle reservation: {}", e);
            }
            settled = quota.get(&reservation.id).map(|r| r.state);
        }

        let was_init = slot.record.lock().status == TaskStatus::Init;
        if was_init {
            if let Err(e) = self.mark_running(slot).await {
                warn!("Failed to persist running status: {}", e);
            }
        }

        let snapshot = {
            let mut record = slot.record.lock();
            match &outcome {
                Outcome::Complete(result) => {
                    record.status = TaskStatus::Complete;
                    record.result = result.clone();
                }
                Outcome::Failed(error) => {
                    record.status = TaskStatus::Failed;
                    record.error = Some(error.clone());
                }
            }
            if let (Some(state), Some(reservation)) = (settled, record.reservation.as_mut()) {
                reservation.state = state;
            }
            record.updated_at = Utc::now();
            record.clone()
        };

        if let Err(e) = self.persist(&snapshot).await {
            error!(task_id = %snapshot.id, "Failed to persist terminal task record: {}", e);
        }

        self.emit(TaskEvent::StatusChanged {
            task_id: snapshot.id.clone(),
            status: snapshot.status,
        });
        slot.status.send_replace(snapshot.status);
        self.inner
            .metrics
            .tasks_finished
            .with_label_values(&[&snapshot.name, &snapshot.status.to_string()])
            .inc();
        self.inner.metrics.active_tasks.dec();

        match &outcome {
            Outcome::Complete(_) => info!(
                task_id = %snapshot.id,
                workflow = %snapshot.name,
                "Task complete"
            ),
            Outcome::Failed(error) => warn!(
                task_id = %snapshot.id,
                workflow = %snapshot.name,
                stage = %snapshot.stage,
                error = %error,
                "Task failed"
            ),
        }

        if let Some(parent_id) = &snapshot.parent_id {
            self.child_finished(parent_id, &snapshot.id, outcome);
        }
    }

    fn child_finished(&self, parent_id: &TaskId, child_id: &TaskId, outcome: Outcome) {
        let Ok(parent) = self.slot(parent_id) else {
            warn!(task_id = %child_id, parent_id = %parent_id, "Parent of finished task is unknown");
            return;
        };

        parent.children.lock().remove(child_id);
        let input = match outcome {
            Outcome::Complete(result) => StageInput::ChildCompleted {
                child: child_id.clone(),
                result,
            },
            Outcome::Failed(error) => StageInput::Failed {
                error,
                child: Some(child_id.clone()),
            },
        };
        self.enqueue(parent, input);
    }

    async fn persist(&self, record: &TaskRecord) -> Result<()> {
        self.inner.store.save(record).await
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

// =============================================================================
// Stage Context
// =============================================================================

pub(crate) struct DispatchCore {
    engine: TaskEngine,
    slot: Arc<TaskSlot>,
    input: StageInput,
    outcome: Option<Outcome>,
}

/// A handler's view of the task during one dispatch
pub struct StageContext<S> {
    core: DispatchCore,
    _stage: PhantomData<fn() -> S>,
}

impl<S: WorkflowStage> StageContext<S> {
    pub(crate) fn new(core: DispatchCore) -> Self {
        Self {
            core,
            _stage: PhantomData,
        }
    }

    pub(crate) fn into_core(self) -> DispatchCore {
        self.core
    }

    pub fn task_id(&self) -> TaskId {
        self.core.slot.id()
    }

    pub fn record(&self) -> TaskRecord {
        self.core.slot.snapshot()
    }

    pub fn target(&self) -> ResourceRef {
        self.core.slot.record.lock().target.clone()
    }

    pub fn credential(&self) -> Credential {
        self.core.slot.record.lock().credential.clone()
    }

    /// Persisted parameter bag
    pub fn params(&self) -> TaskParams {
        self.core.slot.record.lock().params.clone()
    }

    /// Parameters merged with the data carried by this wake-up
    pub fn data(&self) -> TaskParams {
        let mut data = self.params();
        if let Some(Value::Object(extra)) = self.core.input.payload() {
            for (key, value) in extra {
                data.insert(key.clone(), value.clone());
            }
        }
        data
    }

    pub fn input(&self) -> &StageInput {
        &self.core.input
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            engine: self.core.engine.clone(),
            id: self.task_id(),
        }
    }

    /// Children that have not finished yet
    pub fn outstanding_children(&self) -> usize {
        self.core.slot.children.lock().len()
    }

    /// Move to `stage`, merging `params` into the bag, and persist
    pub async fn set_stage(&mut self, stage: S, params: Option<TaskParams>) -> Result<()> {
        if self.core.outcome.is_some() {
            return Err(Error::NotInDispatch {
                task_id: self.task_id().to_string(),
            });
        }

        let (from, snapshot) = {
            let mut record = self.core.slot.record.lock();
            let from = record.stage.clone();
            if let Some(current) = S::parse(&from) {
                if stage.position() < current.position() {
                    return Err(Error::StageRegression {
                        task_id: record.id.to_string(),
                        from,
                        to: stage.as_str().to_string(),
                    });
                }
            }

            if let Some(params) = params {
                for (key, value) in params {
                    record.params.insert(key, value);
                }
            }

            let now = Utc::now();
            if from != stage.as_str() {
                let name = stage.as_str().to_string();
                record.stage = name.clone();
                record.history.push(StageTransition { stage: name, at: now });
            }
            record.updated_at = now;
            (from, record.clone())
        };

        self.core.engine.persist(&snapshot).await?;

        if from != snapshot.stage {
            info!(
                task_id = %snapshot.id,
                workflow = %snapshot.name,
                from = %from,
                to = %snapshot.stage,
                "Task stage changed"
            );
            self.core.engine.emit(TaskEvent::StageChanged {
                task_id: snapshot.id.clone(),
                from,
                to: snapshot.stage.clone(),
            });
        }
        Ok(())
    }

    /// Finish the task once this dispatch returns
    pub fn complete(&mut self, result: Option<Value>) {
        self.core.outcome = Some(Outcome::Complete(result));
    }

    /// Fail the task once this dispatch returns
    pub fn fail(&mut self, error: impl Into<TaskError>) {
        self.core.outcome = Some(Outcome::Failed(error.into()));
    }

    /// Commit the task's reservation ahead of its terminal status
    pub async fn commit_reservation(&mut self) -> Result<Option<Resolution>> {
        let reservation = self.core.slot.record.lock().reservation.clone();
        let Some(reservation) = reservation else {
            return Ok(None);
        };

        let quota = &self.core.engine.inner.quota;
        let resolution = quota.commit(&reservation.id)?;
        let state = quota
            .get(&reservation.id)
            .map(|r| r.state)
            .unwrap_or(ReservationState::Committed);

        let snapshot = {
            let mut record = self.core.slot.record.lock();
            if let Some(r) = record.reservation.as_mut() {
                r.state = state;
            }
            record.clone()
        };
        self.core.engine.persist(&snapshot).await?;
        Ok(Some(resolution))
    }

    /// Detach the reservation so it can be handed to a child task
    pub async fn take_reservation(&mut self) -> Result<Option<Reservation>> {
        let (taken, snapshot) = {
            let mut record = self.core.slot.record.lock();
            let taken = record.reservation.take();
            (taken, record.clone())
        };
        if taken.is_some() {
            self.core.engine.persist(&snapshot).await?;
        }
        Ok(taken)
    }

    /// Create and schedule a child task under the same credential. The
    /// child reports to the stage the parent is in when it finishes, so move
    /// to the joining stage first.
    pub async fn spawn_child(
        &self,
        workflow: &str,
        target: ResourceRef,
        params: TaskParams,
        reservation: Option<Reservation>,
    ) -> Result<TaskHandle> {
        self.handle()
            .new_child(workflow, target, params, reservation)
            .await
    }
}

// =============================================================================
// Task Handle
// =============================================================================

/// Reference to a live task, used by drivers and callers
#[derive(Clone)]
pub struct TaskHandle {
    engine: TaskEngine,
    id: TaskId,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Re-dispatch the current stage with `extra` merged into its data
    pub fn schedule_run(&self, extra: Option<Value>) -> Result<()> {
        self.engine.schedule(&self.id, StageInput::Run { extra })
    }

    /// Deliver an asynchronous failure to the current stage
    pub fn schedule_failed(&self, error: &Error) -> Result<()> {
        self.engine.schedule(
            &self.id,
            StageInput::Failed {
                error: error.into(),
                child: None,
            },
        )
    }

    /// Create and schedule a child of this task
    pub async fn new_child(
        &self,
        workflow: &str,
        target: ResourceRef,
        params: TaskParams,
        reservation: Option<Reservation>,
    ) -> Result<TaskHandle> {
        let credential = self.engine.slot(&self.id)?.record.lock().credential.clone();
        let request = NewTask::new(workflow, target, credential)
            .with_params(params)
            .with_parent(self.id.clone())
            .with_reservation(reservation);

        let child = self.engine.new_task(request).await?;
        child.schedule_run(None)?;
        Ok(child)
    }

    pub async fn record(&self) -> Result<TaskRecord> {
        self.engine.get(&self.id).await
    }

    /// Resolve once the task is terminal
    pub async fn wait(&self) -> Result<TaskRecord> {
        let slot = self.engine.slot(&self.id)?;
        let mut status = slot.status.subscribe();
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            status
                .changed()
                .await
                .map_err(|_| Error::Internal("task status channel closed".into()))?;
        }
        Ok(slot.snapshot())
    }

    pub async fn cancel(&self) -> Result<()> {
        self.engine.cancel(&self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaDeltas, QuotaResource, QuotaScope};
    use crate::task::record::params;
    use crate::task::workflow::WorkflowHandler;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cred() -> Credential {
        Credential::new("default", "p1")
    }

    fn scope() -> QuotaScope {
        QuotaScope::new("default", "p1")
    }

    // ---- a two-step workflow with an async "backend" callback ----

    crate::workflow_stages! {
        enum TwoStep {
            Init => "init",
            OnBackendDone => "on_backend_done",
        }
    }

    struct TwoStepHandler {
        fail_backend: bool,
    }

    #[async_trait]
    impl WorkflowHandler for TwoStepHandler {
        type Stage = TwoStep;

        async fn on_stage(&self, stage: TwoStep, ctx: &mut StageContext<TwoStep>) -> Result<()> {
            match stage {
                TwoStep::Init => {
                    ctx.set_stage(TwoStep::OnBackendDone, Some(params(json!({"step": 1}))))
                        .await?;
                    let handle = ctx.handle();
                    let fail = self.fail_backend;
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        if fail {
                            let _ = handle.schedule_failed(&Error::backend("sim", "create_vm", "boom"));
                        } else {
                            let _ = handle.schedule_run(Some(json!({"external_id": "i-1"})));
                        }
                    });
                    Ok(())
                }
                TwoStep::OnBackendDone => {
                    let data = ctx.data();
                    ctx.complete(data.get("external_id").cloned());
                    Ok(())
                }
            }
        }
    }

    // ---- a parent that fans out to two-step children ----

    crate::workflow_stages! {
        enum FanOut {
            Init => "init",
            OnChildrenDone => "on_children_done",
        }
    }

    struct FanOutHandler {
        children: usize,
    }

    #[async_trait]
    impl WorkflowHandler for FanOutHandler {
        type Stage = FanOut;

        async fn on_stage(&self, stage: FanOut, ctx: &mut StageContext<FanOut>) -> Result<()> {
            match stage {
                FanOut::Init => {
                    ctx.set_stage(FanOut::OnChildrenDone, None).await?;
                    for i in 0..self.children {
                        ctx.spawn_child(
                            "TwoStep",
                            ResourceRef::disk(format!("d-{}", i)),
                            TaskParams::new(),
                            None,
                        )
                        .await?;
                    }
                    Ok(())
                }
                FanOut::OnChildrenDone => {
                    if ctx.outstanding_children() == 0 {
                        ctx.complete(None);
                    }
                    Ok(())
                }
            }
        }
    }

    // ---- a workflow that tries to go backwards ----

    crate::workflow_stages! {
        enum Backwards {
            Init => "init",
            Later => "later",
        }
    }

    struct BackwardsHandler;

    #[async_trait]
    impl WorkflowHandler for BackwardsHandler {
        type Stage = Backwards;

        async fn on_stage(
            &self,
            stage: Backwards,
            ctx: &mut StageContext<Backwards>,
        ) -> Result<()> {
            match stage {
                Backwards::Init => {
                    ctx.set_stage(Backwards::Later, None).await?;
                    ctx.handle().schedule_run(None)
                }
                Backwards::Later => ctx.set_stage(Backwards::Init, None).await,
            }
        }
    }

    // ---- counts concurrent dispatches ----

    crate::workflow_stages! {
        enum Counting {
            Init => "init",
        }
    }

    struct CountingHandler {
        active: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkflowHandler for CountingHandler {
        type Stage = Counting;

        async fn on_stage(&self, _stage: Counting, ctx: &mut StageContext<Counting>) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.runs.fetch_add(1, Ordering::SeqCst) + 1 >= 5 {
                ctx.complete(None);
            }
            Ok(())
        }
    }

    // ---- waits forever for a callback; one stage is not resumable ----

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Parked {
        Init,
        Waiting,
        Critical,
    }

    impl WorkflowStage for Parked {
        fn as_str(&self) -> &'static str {
            match self {
                Parked::Init => "init",
                Parked::Waiting => "waiting",
                Parked::Critical => "critical",
            }
        }

        fn all() -> &'static [Self] {
            &[Parked::Init, Parked::Waiting, Parked::Critical]
        }

        fn resumable(&self) -> bool {
            !matches!(self, Parked::Critical)
        }
    }

    struct ParkedHandler {
        park_at: Parked,
    }

    #[async_trait]
    impl WorkflowHandler for ParkedHandler {
        type Stage = Parked;

        async fn on_stage(&self, stage: Parked, ctx: &mut StageContext<Parked>) -> Result<()> {
            match stage {
                Parked::Init => ctx.set_stage(self.park_at, None).await,
                Parked::Waiting | Parked::Critical => {
                    if ctx.input().payload().is_some() {
                        ctx.complete(None);
                    }
                    Ok(())
                }
            }
        }
    }

    // ---- completes in its first dispatch ----

    crate::workflow_stages! {
        enum Immediate {
            Init => "init",
        }
    }

    struct ImmediateHandler;

    #[async_trait]
    impl WorkflowHandler for ImmediateHandler {
        type Stage = Immediate;

        async fn on_stage(
            &self,
            _stage: Immediate,
            ctx: &mut StageContext<Immediate>,
        ) -> Result<()> {
            ctx.complete(Some(json!("done")));
            Ok(())
        }
    }

    // ---- joins immediate children, then waits for callback data ----

    crate::workflow_stages! {
        enum Join {
            Init => "init",
            OnChildren => "on_children",
            OnCallback => "on_callback",
        }
    }

    struct JoinHandler;

    #[async_trait]
    impl WorkflowHandler for JoinHandler {
        type Stage = Join;

        async fn on_stage(&self, stage: Join, ctx: &mut StageContext<Join>) -> Result<()> {
            match stage {
                Join::Init => {
                    ctx.set_stage(Join::OnChildren, None).await?;
                    for i in 0..2 {
                        ctx.spawn_child(
                            "Immediate",
                            ResourceRef::disk(format!("d-{}", i)),
                            TaskParams::new(),
                            None,
                        )
                        .await?;
                    }
                    // Both children report while this dispatch is still running
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                }
                Join::OnChildren => {
                    if ctx.outstanding_children() > 0 {
                        return Ok(());
                    }
                    ctx.set_stage(Join::OnCallback, None).await?;
                    ctx.handle().schedule_run(Some(json!({"answer": 42})))
                }
                Join::OnCallback => {
                    let answer = ctx.data().get("answer").cloned().ok_or_else(|| {
                        Error::ValidationFailed("callback carries no answer".into())
                    })?;
                    ctx.complete(Some(answer));
                    Ok(())
                }
            }
        }
    }

    // ---- one parked child and one failing child ----

    crate::workflow_stages! {
        enum Mixed {
            Init => "init",
            OnChildren => "on_children",
        }
    }

    struct MixedHandler;

    #[async_trait]
    impl WorkflowHandler for MixedHandler {
        type Stage = Mixed;

        async fn on_stage(&self, stage: Mixed, ctx: &mut StageContext<Mixed>) -> Result<()> {
            match stage {
                Mixed::Init => {
                    ctx.set_stage(Mixed::OnChildren, None).await?;
                    ctx.spawn_child("Parked", ResourceRef::disk("d-slow"), TaskParams::new(), None)
                        .await?;
                    ctx.spawn_child(
                        "FailingTwoStep",
                        ResourceRef::disk("d-bad"),
                        TaskParams::new(),
                        None,
                    )
                    .await?;
                    Ok(())
                }
                Mixed::OnChildren => {
                    if ctx.outstanding_children() == 0 {
                        ctx.complete(None);
                    }
                    Ok(())
                }
            }
        }
    }

    fn engine_with(store: TaskStoreRef, quota: QuotaLedgerRef) -> TaskEngine {
        TaskEngine::builder()
            .workflow("TwoStep", TwoStepHandler { fail_backend: false })
            .workflow("FailingTwoStep", TwoStepHandler { fail_backend: true })
            .workflow("FanOut", FanOutHandler { children: 3 })
            .workflow("Backwards", BackwardsHandler)
            .workflow("Parked", ParkedHandler { park_at: Parked::Waiting })
            .workflow("ParkedCritical", ParkedHandler { park_at: Parked::Critical })
            .workflow("Immediate", ImmediateHandler)
            .workflow("Join", JoinHandler)
            .workflow("Mixed", MixedHandler)
            .store(store)
            .quota(quota)
            .build()
            .unwrap()
    }

    fn engine() -> TaskEngine {
        engine_with(MemoryTaskStore::new(), QuotaLedger::new())
    }

    async fn wait_for_stage(engine: &TaskEngine, id: &TaskId, stage: &str) {
        for _ in 0..200 {
            if engine.get(id).await.unwrap().stage == stage {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached stage {}", id, stage);
    }

    #[tokio::test]
    async fn test_unknown_workflow_rejected_at_creation() {
        let engine = engine();
        let err = engine
            .new_task(NewTask::new("Nope", ResourceRef::guest("g"), cred()))
            .await
            .unwrap_err();

        assert_matches!(err, Error::UnknownWorkflow { workflow } if workflow == "Nope");
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_async_callback_completes_task() {
        let engine = engine();
        let mut events = engine.subscribe();

        let handle = engine
            .start(NewTask::new("TwoStep", ResourceRef::guest("g-1"), cred()))
            .await
            .unwrap();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status, TaskStatus::Complete);
        assert_eq!(record.result, Some(json!("i-1")));
        assert_eq!(record.stage_path(), vec!["init", "on_backend_done"]);
        assert_eq!(record.params.get("step"), Some(&json!(1)));

        // Status sequence is exactly INIT -> RUNNING -> COMPLETE
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::StatusChanged { task_id, status } = event {
                if &task_id == handle.id() {
                    statuses.push(status);
                }
            }
        }
        assert_eq!(statuses, vec![TaskStatus::Running, TaskStatus::Complete]);

        // Terminal tasks cannot be scheduled again
        assert_matches!(handle.schedule_run(None), Err(Error::TaskTerminal { .. }));
    }

    #[tokio::test]
    async fn test_backend_failure_cancels_reservation() {
        let quota = QuotaLedger::new();
        let engine = engine_with(MemoryTaskStore::new(), quota.clone());
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 2))
            .unwrap();

        let handle = engine
            .start(
                NewTask::new("FailingTwoStep", ResourceRef::guest("g-1"), cred())
                    .with_reservation(Some(reservation.clone())),
            )
            .await
            .unwrap();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, "backend_failure");
        assert_eq!(
            quota.get(&reservation.id).unwrap().state,
            ReservationState::Cancelled
        );
        assert_eq!(
            record.reservation.unwrap().state,
            ReservationState::Cancelled
        );
        assert!(quota.usage(&scope()).is_empty());
    }

    #[tokio::test]
    async fn test_success_commits_reservation() {
        let quota = QuotaLedger::new();
        let engine = engine_with(MemoryTaskStore::new(), quota.clone());
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 2))
            .unwrap();

        let record = engine
            .start(
                NewTask::new("TwoStep", ResourceRef::guest("g-1"), cred())
                    .with_reservation(Some(reservation.clone())),
            )
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Complete);
        assert_eq!(
            quota.get(&reservation.id).unwrap().state,
            ReservationState::Committed
        );
        assert_eq!(quota.usage(&scope()).get(&QuotaResource::Cpu), Some(&2));
    }

    #[tokio::test]
    async fn test_parent_finishes_after_all_children() {
        let engine = engine();
        let parent = engine
            .start(NewTask::new("FanOut", ResourceRef::guest("g-1"), cred()))
            .await
            .unwrap();
        let parent_record = parent.wait().await.unwrap();
        assert_eq!(parent_record.status, TaskStatus::Complete);

        let children = engine.children(parent.id()).await.unwrap();
        assert_eq!(children.len(), 3);
        for child in &children {
            assert_eq!(child.status, TaskStatus::Complete);
            assert_eq!(child.credential, parent_record.credential);
            assert!(child.updated_at <= parent_record.updated_at);
        }
    }

    #[tokio::test]
    async fn test_stage_regression_fails_task() {
        let engine = engine();
        let record = engine
            .start(NewTask::new("Backwards", ResourceRef::guest("g-1"), cred()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "stage_regression");
        assert_eq!(record.stage, "later");
    }

    #[tokio::test]
    async fn test_single_dispatch_per_task() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = TaskEngine::builder()
            .workflow(
                "Counting",
                CountingHandler {
                    active: active.clone(),
                    max_seen: max_seen.clone(),
                    runs: runs.clone(),
                },
            )
            .build()
            .unwrap();

        let handle = engine
            .new_task(NewTask::new("Counting", ResourceRef::guest("g"), cred()))
            .await
            .unwrap();
        for _ in 0..5 {
            handle.schedule_run(None).unwrap();
        }

        let record = handle.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cancel_at_stage_boundary_releases_quota() {
        let quota = QuotaLedger::new();
        let engine = engine_with(MemoryTaskStore::new(), quota.clone());
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Guests, 1))
            .unwrap();

        let handle = engine
            .start(
                NewTask::new("Parked", ResourceRef::guest("g-1"), cred())
                    .with_reservation(Some(reservation.clone())),
            )
            .await
            .unwrap();
        wait_for_stage(&engine, handle.id(), "waiting").await;

        handle.cancel().await.unwrap();
        let record = handle.wait().await.unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "task_cancelled");
        assert!(record.cancelled);
        assert_eq!(
            quota.get(&reservation.id).unwrap().state,
            ReservationState::Cancelled
        );
        assert_matches!(handle.cancel().await, Err(Error::TaskTerminal { .. }));
    }

    #[tokio::test]
    async fn test_child_of_terminal_parent_rejected() {
        let engine = engine();
        let parent = engine
            .start(NewTask::new("TwoStep", ResourceRef::guest("g-1"), cred()))
            .await
            .unwrap();
        parent.wait().await.unwrap();

        let err = parent
            .new_child("TwoStep", ResourceRef::disk("d"), TaskParams::new(), None)
            .await
            .unwrap_err();
        assert_matches!(err, Error::TaskTerminal { .. });
    }

    #[tokio::test]
    async fn test_resume_continues_from_persisted_stage() {
        let store: TaskStoreRef = MemoryTaskStore::new();
        let quota = QuotaLedger::new();
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Cpu, 1))
            .unwrap();

        let (waiting_id, critical_id) = {
            let first = engine_with(store.clone(), quota.clone());
            let waiting = first
                .start(
                    NewTask::new("Parked", ResourceRef::guest("g-1"), cred())
                        .with_reservation(Some(reservation.clone())),
                )
                .await
                .unwrap();
            let critical = first
                .start(NewTask::new("ParkedCritical", ResourceRef::guest("g-2"), cred()))
                .await
                .unwrap();
            wait_for_stage(&first, waiting.id(), "waiting").await;
            wait_for_stage(&first, critical.id(), "critical").await;
            (waiting.id().clone(), critical.id().clone())
        };

        // A fresh process with an empty ledger over the same store
        let fresh_quota = QuotaLedger::new();
        let second = engine_with(store, fresh_quota.clone());
        let report = second.resume().await.unwrap();

        assert_eq!(report.resumed, vec![waiting_id.clone()]);
        assert_eq!(report.interrupted, vec![critical_id.clone()]);

        let critical = second.get(&critical_id).await.unwrap();
        assert_eq!(critical.status, TaskStatus::Failed);
        assert_eq!(critical.error.unwrap().kind, "task_interrupted");

        // The resumed task still answers its callback
        let handle = second.handle(&waiting_id).unwrap();
        handle.schedule_run(Some(json!({"done": true}))).unwrap();
        let record = handle.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete);
        assert_eq!(record.stage, "waiting");
        assert_eq!(
            fresh_quota.get(&reservation.id).unwrap().state,
            ReservationState::Committed
        );
    }

    #[tokio::test]
    async fn test_late_child_wakeup_does_not_reach_next_stage() {
        let engine = engine();
        let record = engine
            .start(NewTask::new("Join", ResourceRef::guest("g-1"), cred()))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Complete, "error: {:?}", record.error);
        assert_eq!(record.result, Some(json!(42)));
        assert_eq!(record.stage_path(), vec!["init", "on_children", "on_callback"]);
    }

    #[tokio::test]
    async fn test_child_failure_fails_parent_after_siblings_finish() {
        let quota = QuotaLedger::new();
        let engine = engine_with(MemoryTaskStore::new(), quota.clone());
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Guests, 1))
            .unwrap();

        let parent = engine
            .start(
                NewTask::new("Mixed", ResourceRef::guest("g-1"), cred())
                    .with_reservation(Some(reservation.clone())),
            )
            .await
            .unwrap();
        let mut children = Vec::new();
        for _ in 0..200 {
            children = engine.children(parent.id()).await.unwrap();
            if children.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let failing = children.iter().find(|c| c.name == "FailingTwoStep").unwrap();
        let parked = children.iter().find(|c| c.name == "Parked").unwrap();

        let failed = engine.handle(&failing.id).unwrap().wait().await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        wait_for_stage(&engine, &parked.id, "waiting").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The failure is held while the sibling is still running
        let held = engine.get(parent.id()).await.unwrap();
        assert_eq!(held.status, TaskStatus::Running);
        assert_eq!(
            quota.get(&reservation.id).unwrap().state,
            ReservationState::Pending
        );

        let sibling = engine.handle(&parked.id).unwrap();
        sibling.schedule_run(Some(json!({"done": true}))).unwrap();
        let sibling = sibling.wait().await.unwrap();
        let record = parent.wait().await.unwrap();

        assert_eq!(sibling.status, TaskStatus::Complete);
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "backend_failure");
        assert!(record.updated_at >= sibling.updated_at);
        assert_eq!(
            quota.get(&reservation.id).unwrap().state,
            ReservationState::Cancelled
        );
        assert!(quota.usage(&scope()).is_empty());
    }

    #[tokio::test]
    async fn test_resume_redelivers_outcomes_of_finished_children() {
        let store: TaskStoreRef = MemoryTaskStore::new();
        let quota = QuotaLedger::new();
        let reservation = quota
            .reserve(&scope(), QuotaDeltas::new().with(QuotaResource::Guests, 1))
            .unwrap();

        // Parent waiting at its join; both children finished before the crash
        let parent_id = TaskId::generate();
        let mut parent = TaskRecord::new(
            parent_id.clone(),
            NewTask::new("Join", ResourceRef::guest("g-1"), cred())
                .with_reservation(Some(reservation.clone())),
            "init",
        );
        let entered = Utc::now();
        parent.status = TaskStatus::Running;
        parent.stage = "on_children".to_string();
        parent.history.push(StageTransition {
            stage: "on_children".to_string(),
            at: entered,
        });
        parent.updated_at = entered;
        store.save(&parent).await.unwrap();

        let mut done = TaskRecord::new(
            TaskId::generate(),
            NewTask::new("Immediate", ResourceRef::disk("d-0"), cred()).with_parent(parent_id.clone()),
            "init",
        );
        done.status = TaskStatus::Complete;
        done.result = Some(json!("done"));
        done.updated_at = entered + chrono::Duration::milliseconds(1);
        store.save(&done).await.unwrap();

        let mut broken = TaskRecord::new(
            TaskId::generate(),
            NewTask::new("Immediate", ResourceRef::disk("d-1"), cred()).with_parent(parent_id.clone()),
            "init",
        );
        broken.status = TaskStatus::Failed;
        broken.error = Some(TaskError::new("backend_failure", "disk create failed"));
        broken.updated_at = entered + chrono::Duration::milliseconds(2);
        store.save(&broken).await.unwrap();

        let fresh_quota = QuotaLedger::new();
        let engine = engine_with(store, fresh_quota.clone());
        let report = engine.resume().await.unwrap();
        assert_eq!(report.resumed, vec![parent_id.clone()]);
        assert_eq!(report.waiting, 0);

        let record = engine.handle(&parent_id).unwrap().wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.unwrap().kind, "backend_failure");
        assert_eq!(record.stage, "on_children");
        assert_eq!(
            fresh_quota.get(&reservation.id).unwrap().state,
            ReservationState::Cancelled
        );
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_workflow_registration_panics() {
        let _ = TaskEngine::builder()
            .workflow("TwoStep", TwoStepHandler { fail_backend: false })
            .workflow("TwoStep", TwoStepHandler { fail_backend: true });
    }
}
