//! Response pipeline engine
//!
//! Actions wrap invocable capabilities, pipelines order actions, the
//! resolver binds a pipeline to an offence, and the executor runs the
//! result and keeps the report history.

pub mod action;
pub mod executor;
pub mod pipeline;
pub mod resolver;

pub use action::{
    ActionDraft, ActionRegistry, ActionUpdate, CapabilityRegistry, ResponseAction,
    ResponseActionType, ResponseCapability,
};
pub use executor::{
    ExecutionReport, ExecutionStatus, ExecutionTrigger, PipelineExecutor, StepOutcome, StepReport,
};
pub use pipeline::{
    ActionParamsTemplate, PipelineActionConfig, PipelineDraft, PipelineRegistry, PipelineUpdate,
    ResponsePipeline,
};
pub use resolver::{PipelineResolver, ResolvedPipeline, ResolvedStep};
