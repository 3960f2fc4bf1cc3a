//! Workflow Definitions
//!
//! A workflow is a typed, ordered stage enumeration plus one handler. The
//! ordered stage list doubles as the transition table: a task may stay on
//! its current stage or move to any later one, never back.

use crate::error::{Error, Result};
use crate::task::engine::{DispatchCore, StageContext};
use crate::task::record::{TaskError, TaskId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::marker::PhantomData;

// =============================================================================
// Stages
// =============================================================================

/// Declared stages of one workflow, in execution order
pub trait WorkflowStage: Copy + Eq + Send + Sync + std::fmt::Debug + 'static {
    fn as_str(&self) -> &'static str;

    /// Every stage in declared order; the first one is the init stage
    fn all() -> &'static [Self];

    /// Whether re-dispatching this stage after a restart is safe
    fn resumable(&self) -> bool {
        true
    }

    fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.as_str() == name)
    }

    fn position(&self) -> usize {
        Self::all()
            .iter()
            .position(|s| s == self)
            .unwrap_or(usize::MAX)
    }
}

/// Declare a stage enum and its `WorkflowStage` impl in one go.
/// A stage tagged `@ no_resume` fails with `TaskInterrupted` on restart.
#[macro_export]
macro_rules! workflow_stages {
    (@resumable) => { true };
    (@resumable no_resume) => { false };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $label:literal $(@ $flag:ident)?),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::task::WorkflowStage for $name {
            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            fn all() -> &'static [Self] {
                &[$($name::$variant),+]
            }

            fn resumable(&self) -> bool {
                match self {
                    $($name::$variant => $crate::workflow_stages!(@resumable $($flag)?)),+
                }
            }
        }
    };
}

// =============================================================================
// Stage Input
// =============================================================================

/// What woke a task up for this dispatch
#[derive(Debug, Clone)]
pub enum StageInput {
    /// First run, resume, or a backend completion callback
    Run { extra: Option<Value> },
    /// A child task completed
    ChildCompleted { child: TaskId, result: Option<Value> },
    /// A backend callback or a child task failed
    Failed {
        error: TaskError,
        child: Option<TaskId>,
    },
}

impl StageInput {
    pub fn run() -> Self {
        StageInput::Run { extra: None }
    }

    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            StageInput::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn child(&self) -> Option<&TaskId> {
        match self {
            StageInput::ChildCompleted { child, .. } => Some(child),
            StageInput::Failed { child, .. } => child.as_ref(),
            StageInput::Run { .. } => None,
        }
    }

    /// Data carried alongside the wake-up
    pub fn payload(&self) -> Option<&Value> {
        match self {
            StageInput::Run { extra } => extra.as_ref(),
            StageInput::ChildCompleted { result, .. } => result.as_ref(),
            StageInput::Failed { .. } => None,
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Stage handlers of one workflow
#[async_trait]
pub trait WorkflowHandler: Send + Sync + 'static {
    type Stage: WorkflowStage;

    /// Run `stage`. The handler either finishes the task, moves it with
    /// `set_stage`, or leaves it parked until a callback schedules it again.
    async fn on_stage(&self, stage: Self::Stage, ctx: &mut StageContext<Self::Stage>)
        -> Result<()>;

    /// Called instead of `on_stage` when the wake-up is a failure
    async fn on_stage_failed(
        &self,
        _stage: Self::Stage,
        ctx: &mut StageContext<Self::Stage>,
        error: &TaskError,
    ) -> Result<()> {
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// Type Erasure
// =============================================================================

#[async_trait]
pub(crate) trait ErasedWorkflow: Send + Sync {
    fn stage_names(&self) -> Vec<&'static str>;

    fn init_stage(&self) -> &'static str;

    fn is_resumable(&self, stage: &str) -> Option<bool>;

    async fn dispatch(&self, stage: &str, core: DispatchCore) -> (DispatchCore, Result<()>);
}

pub(crate) struct Workflow<H: WorkflowHandler> {
    name: String,
    handler: H,
    _stage: PhantomData<fn() -> H::Stage>,
}

impl<H: WorkflowHandler> Workflow<H> {
    /// Panics on an empty or ambiguous stage list
    pub(crate) fn new(name: String, handler: H) -> Self {
        let stages = H::Stage::all();
        if stages.is_empty() {
            panic!("workflow {} declares no stages", name);
        }

        let mut seen = HashSet::new();
        for stage in stages {
            if !seen.insert(stage.as_str()) {
                panic!(
                    "workflow {} declares stage {} more than once",
                    name,
                    stage.as_str()
                );
            }
        }

        Self {
            name,
            handler,
            _stage: PhantomData,
        }
    }
}

#[async_trait]
impl<H: WorkflowHandler> ErasedWorkflow for Workflow<H> {
    fn stage_names(&self) -> Vec<&'static str> {
        H::Stage::all().iter().map(|s| s.as_str()).collect()
    }

    fn init_stage(&self) -> &'static str {
        H::Stage::all()[0].as_str()
    }

    fn is_resumable(&self, stage: &str) -> Option<bool> {
        H::Stage::parse(stage).map(|s| s.resumable())
    }

    async fn dispatch(&self, stage: &str, core: DispatchCore) -> (DispatchCore, Result<()>) {
        let Some(stage) = H::Stage::parse(stage) else {
            let err = Error::StageNotFound {
                workflow: self.name.clone(),
                stage: stage.to_string(),
            };
            return (core, Err(err));
        };

        let mut ctx = StageContext::<H::Stage>::new(core);
        let failure = ctx.input().failure().cloned();
        let result = match failure {
            Some(error) => self.handler.on_stage_failed(stage, &mut ctx, &error).await,
            None => self.handler.on_stage(stage, &mut ctx).await,
        };
        (ctx.into_core(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::workflow_stages! {
        enum Sample {
            Init => "init",
            Middle => "middle" @ no_resume,
            Done => "done",
        }
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Sample::all().len(), 3);
        assert_eq!(Sample::parse("middle"), Some(Sample::Middle));
        assert_eq!(Sample::parse("nope"), None);
        assert!(Sample::Init.position() < Sample::Done.position());
        assert!(!Sample::Middle.resumable());
        assert!(Sample::Done.resumable());
    }

    #[test]
    fn test_stage_input_accessors() {
        let input = StageInput::ChildCompleted {
            child: TaskId::from("task-1"),
            result: Some(serde_json::json!({"ok": true})),
        };
        assert_eq!(input.child().map(|c| c.as_str()), Some("task-1"));
        assert!(input.failure().is_none());
        assert!(input.payload().is_some());

        let failed = StageInput::Failed {
            error: TaskError::new("backend_failure", "boom"),
            child: None,
        };
        assert!(failed.failure().is_some());
        assert!(failed.payload().is_none());
    }
}
