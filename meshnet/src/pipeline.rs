//! Receive/send pipelines: an ordered sequence of steps, each able to pass the frame along,
//! discard it, or force the owning connection to disconnect.

use crate::connection::Uid;
use std::sync::Arc;

/// What a pipeline step decided to do with the frame it was given.
#[derive(Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// Continue to the next step (or, if this was the last step, treat the frame as fully
    /// processed).
    Success,
    /// Drop the frame silently; later steps do not run.
    Discard,
    /// Drop the frame and disconnect the connection it came from; later steps do not run and no
    /// further pipeline runs for this connection this tick.
    DisconnectClient,
}

/// Context passed to every pipeline step: the connection the frame is associated with and the
/// raw bytes being processed in place.
pub struct PipelineParams<'a> {
    pub connection_uid: Uid,
    pub payload: &'a mut Vec<u8>,
}

pub type PipelineStep = Box<dyn Fn(&mut PipelineParams) -> StepOutcome + Send + Sync>;

/// An ordered list of steps run in registration order until one returns anything other than
/// `Success`, or the list is exhausted.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline { steps: Vec::new() }
    }

    pub fn push(&mut self, step: PipelineStep) {
        self.steps.push(step);
    }

    pub fn run(&self, params: &mut PipelineParams) -> StepOutcome {
        for step in &self.steps {
            match step(params) {
                StepOutcome::Success => continue,
                other => return other,
            }
        }
        StepOutcome::Success
    }
}

/// The four pipelines a connection runs its frames through: data moving from a client to the
/// server and from the server to a client, in both the receive and send directions.
#[derive(Default)]
pub struct PipelineSet {
    pub client_to_server_receive: Pipeline,
    pub client_to_server_send: Pipeline,
    pub server_to_client_receive: Pipeline,
    pub server_to_client_send: Pipeline,
}

impl PipelineSet {
    pub fn new() -> PipelineSet {
        PipelineSet::default()
    }
}

/// Shared handle so the engine and the dispatch layer can both reach the same `PipelineSet`
/// without duplicating it per connection (every connection runs the same staged pipeline; only
/// the frame content differs).
pub type SharedPipelineSet = Arc<PipelineSet>;
