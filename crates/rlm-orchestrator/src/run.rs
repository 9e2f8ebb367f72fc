use rlm_core::Message;
use uuid::Uuid;

/// One in-progress agent execution at a given depth of the tree.
#[derive(Debug, Clone)]
pub struct Run {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The run whose code spawned this one; `None` for the root.
    pub parent_run_id: Option<Uuid>,
    /// Distance from the root run.
    pub depth: u32,
    /// Current step; 0 is the priming step.
    pub step: u32,
    /// Model steps this run may take.
    pub max_steps: u32,
    /// Model this run talks to.
    pub model: String,
    /// Cohort this run was started in, if it ran in parallel with siblings.
    pub parallel_group_id: Option<Uuid>,
    transcript: Vec<Message>,
}

impl Run {
    /// Starts a run at step 0 with an empty transcript.
    pub fn new(
        parent_run_id: Option<Uuid>,
        depth: u32,
        max_steps: u32,
        model: impl Into<String>,
        parallel_group_id: Option<Uuid>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            parent_run_id,
            depth,
            step: 0,
            max_steps,
            model: model.into(),
            parallel_group_id,
            transcript: Vec::new(),
        }
    }

    /// Moves to the next step and returns it.
    pub fn advance(&mut self) -> u32 {
        self.step += 1;
        self.step
    }

    /// Appends a message to the transcript.
    pub fn push(&mut self, message: Message) {
        self.transcript.push(message);
    }

    /// The transcript so far.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }
}
