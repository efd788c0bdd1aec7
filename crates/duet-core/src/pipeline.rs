//! Two-stage generation: a Gemini draft, then a Claude review of it.
//!
//! Both stages stream through one [`ChunkStream`] in order. Stage two starts
//! only after stage one has ended successfully, because its prompt is built
//! from the complete stage-one text.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, Role};
use crate::chunk::{ChunkKind, ChunkSender, ChunkStream, chunk_channel};
use crate::config::DuetConfig;
use crate::conversation::ConversationStore;
use crate::errors::{DuetError, RunFailure};
use crate::extract::{extract_first_code, parse_code_blocks};
use crate::runner::{AgentRunner, CliRunner, RunRequest};

pub const REVIEW_CODE_INSTRUCTION: &str = "Review the following code and suggest improvements:";
pub const REVIEW_OUTPUT_INSTRUCTION: &str = "Review the following output and provide feedback:";

/// Builds the stage-two prompt from the stage-one text.
///
/// Uses only the body of the first fenced code block when there is one,
/// otherwise the whole draft verbatim.
pub fn review_prompt(draft: &str) -> String {
    match extract_first_code(draft) {
        Some(code) => format!("{REVIEW_CODE_INSTRUCTION}\n\n{code}"),
        None => format!("{REVIEW_OUTPUT_INSTRUCTION}\n\n{draft}"),
    }
}

/// Per-run settings shared by both stages.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Capacity of the generation's own chunk queue.
    pub stream_buffer_capacity: usize,
}

impl RunSettings {
    pub fn from_config(config: &DuetConfig) -> Self {
        Self {
            work_dir: config.workspace_dir.clone(),
            timeout: config.timeout,
            stream_buffer_capacity: config.stream_buffer_capacity,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOptions {
    /// Ends the generation after the Gemini stage.
    #[serde(default)]
    pub skip_review: bool,
}

/// A started generation.
pub struct Generation {
    pub conversation_id: Uuid,
    pub stream: ChunkStream,
}

/// Runs the two-stage pipeline and records each finished stage.
#[derive(Clone)]
pub struct Generator {
    runner: Arc<dyn AgentRunner>,
    store: Arc<dyn ConversationStore>,
    settings: RunSettings,
}

impl Generator {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        store: Arc<dyn ConversationStore>,
        settings: RunSettings,
    ) -> Self {
        Self {
            runner,
            store,
            settings,
        }
    }

    /// Builds a generator that launches the configured CLIs.
    pub fn from_config(config: &DuetConfig, store: Arc<dyn ConversationStore>) -> Self {
        Self::new(
            Arc::new(CliRunner::from_config(config)),
            store,
            RunSettings::from_config(config),
        )
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Starts a generation.
    ///
    /// The conversation and the user message are recorded before any process
    /// runs. Must be called from within a Tokio runtime.
    pub fn generate(
        &self,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<Generation, DuetError> {
        if prompt.trim().is_empty() {
            return Err(DuetError::Validation("prompt must not be empty".into()));
        }
        let conversation = self.store.create_conversation();
        self.store
            .add_message(conversation.id, Role::User, prompt, Vec::new())?;
        info!(conversation_id = %conversation.id, skip_review = options.skip_review, "starting generation");

        let (sink, stream) = chunk_channel(self.settings.stream_buffer_capacity);
        let generator = self.clone();
        let prompt = prompt.to_string();
        let conversation_id = conversation.id;
        tokio::spawn(async move {
            let result = generator
                .run_stages(conversation_id, prompt, options, &sink)
                .await;
            match &result {
                Ok(()) => info!(%conversation_id, "generation finished"),
                Err(err) => warn!(%conversation_id, error = %err, "generation failed"),
            }
            sink.finish(result);
        });

        Ok(Generation {
            conversation_id,
            stream,
        })
    }

    async fn run_stages(
        &self,
        conversation_id: Uuid,
        prompt: String,
        options: GenerateOptions,
        sink: &ChunkSender,
    ) -> Result<(), DuetError> {
        let draft = self
            .run_stage(conversation_id, Agent::Gemini, prompt, sink)
            .await?;
        if options.skip_review {
            return Ok(());
        }
        if sink.is_closed() || sink.is_aborted() {
            debug!(%conversation_id, "generation stopped before review");
            return Err(RunFailure::Cancelled {
                agent: Agent::Claude,
            }
            .into());
        }
        self.run_stage(conversation_id, Agent::Claude, review_prompt(&draft), sink)
            .await?;
        Ok(())
    }

    /// Forwards one stage's chunks as they arrive and returns its text output.
    async fn run_stage(
        &self,
        conversation_id: Uuid,
        agent: Agent,
        prompt: String,
        sink: &ChunkSender,
    ) -> Result<String, DuetError> {
        let request = RunRequest::new(agent, prompt)
            .work_dir(self.settings.work_dir.clone())
            .timeout(self.settings.timeout);
        let mut stream = self.runner.run(request);
        let abort = stream.abort_handle();
        let mut aborted = false;
        let mut text = String::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next_chunk() => chunk,
                _ = sink.aborted(), if !aborted => {
                    abort.abort();
                    aborted = true;
                    continue;
                }
                _ = sink.closed(), if !aborted => {
                    debug!(%conversation_id, %agent, "generation consumer dropped");
                    abort.abort();
                    aborted = true;
                    continue;
                }
            };
            let Some(chunk) = chunk else { break };
            if chunk.kind == ChunkKind::Text {
                text.push_str(&chunk.content);
            }
            if !sink.send(chunk).await {
                // Dropping `stream` stops the run.
                return Err(RunFailure::Cancelled { agent }.into());
            }
        }
        stream.finish().await?;

        self.store
            .add_message(conversation_id, agent.into(), &text, parse_code_blocks(&text))?;
        debug!(%conversation_id, %agent, len = text.len(), "stage finished");
        Ok(text)
    }
}
