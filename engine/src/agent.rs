//! Conversation loop: memory projection, tool calls, background extraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tally_context::{
    CalculatorMemory, ExtractionClient, FactStore, ModelExtractionClient, load_session,
    save_session,
};
use tally_providers::{ApiConfig, ChatBackend, ChatRequest, LoggingBackend, OpenAIClient};
use tally_tools::ToolRegistry;
use tally_types::{Message, NonEmptyString};

use crate::config::{DEFAULT_MAX_TOOL_ITERATIONS, Settings};

/// Base instructions followed by the memory block, if there is one.
#[must_use]
pub fn compose_instructions(base: &str, memory_block: &str) -> String {
    match (base.trim().is_empty(), memory_block.trim().is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => memory_block.to_string(),
        (false, false) => format!("{}\n\n{memory_block}", base.trim_end()),
    }
}

/// Primary traffic goes through the logging middleware; extraction calls use
/// the bare client so they are not logged as conversation turns.
fn split_backends<C: ChatBackend + 'static>(
    client: Arc<C>,
) -> (Arc<dyn ChatBackend>, Arc<dyn ChatBackend>) {
    let primary: Arc<dyn ChatBackend> = Arc::new(LoggingBackend::new(Arc::clone(&client)));
    (primary, client)
}

pub struct Agent {
    backend: Arc<dyn ChatBackend>,
    tools: ToolRegistry,
    instructions: String,
    max_tool_iterations: usize,
    memory: Option<CalculatorMemory>,
    history: Vec<Message>,
    session_path: Option<PathBuf>,
}

impl Agent {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        tools: ToolRegistry,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            tools,
            instructions: instructions.into(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            memory: None,
            history: Vec::new(),
            session_path: None,
        }
    }

    /// Production wiring: OpenAI behind the logging middleware, the built-in
    /// tools, and memory restored from the session file when configured.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api = ApiConfig::new(settings.api_key.clone(), settings.model.clone())
            .with_base_url(settings.base_url.clone())
            .with_timeout(settings.request_timeout);
        let client = Arc::new(OpenAIClient::new(api).context("failed to build OpenAI client")?);
        let (backend, extraction_backend) = split_backends(client);

        let mut agent = Self::new(
            backend,
            ToolRegistry::with_builtins(),
            settings.instructions.clone(),
        )
        .with_max_tool_iterations(settings.max_tool_iterations);

        if settings.memory_enabled {
            let mut extractor = ModelExtractionClient::new(extraction_backend)
                .with_timeout(settings.extraction_timeout);
            if let Some(model) = &settings.extraction_model {
                extractor = extractor.with_model(model.clone());
            }
            let store = match &settings.session_path {
                Some(path) => load_session(path)?,
                None => FactStore::new(),
            };
            tracing::info!(
                saved_values = store.saved_values().len(),
                session = ?settings.session_path,
                "Calculator memory enabled"
            );
            agent = agent.with_memory(CalculatorMemory::new(Arc::new(extractor), store));
        }

        if let Some(path) = &settings.session_path {
            agent = agent.with_session_path(path.clone());
        }

        Ok(agent)
    }

    pub fn with_memory(mut self, memory: CalculatorMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Attach memory driven by `extractor`, starting from `store`.
    pub fn with_extractor(self, extractor: Arc<dyn ExtractionClient>, store: FactStore) -> Self {
        self.with_memory(CalculatorMemory::new(extractor, store))
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max.max(1);
        self
    }

    pub fn with_session_path(mut self, path: PathBuf) -> Self {
        self.session_path = Some(path);
        self
    }

    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    #[must_use]
    pub fn memory(&self) -> Option<&CalculatorMemory> {
        self.memory.as_ref()
    }

    #[must_use]
    pub fn session_path(&self) -> Option<&Path> {
        self.session_path.as_deref()
    }

    /// Run one user turn and return the assistant's answer.
    ///
    /// A failed turn leaves history and memory untouched.
    pub async fn run_turn(&mut self, input: &str) -> Result<String> {
        let user = Message::try_user(input).map_err(|_| anyhow!("input is empty"))?;

        let memory_block = match &self.memory {
            Some(memory) => memory.before_inference().await,
            None => String::new(),
        };
        let instructions = compose_instructions(&self.instructions, &memory_block);
        let tool_defs = self.tools.definitions();

        let mut turn = vec![user];
        let mut iterations = 0;

        let answer = loop {
            let messages: Vec<Message> = self.history.iter().chain(&turn).cloned().collect();
            let request = ChatRequest::new(messages)
                .with_instructions(instructions.clone())
                .with_tools(tool_defs.clone());
            let response = self.backend.respond(request).await?;

            if !response.has_tool_calls() {
                let text = response
                    .text
                    .or(response.refusal)
                    .ok_or_else(|| anyhow!("model returned no answer"))?;
                break NonEmptyString::new(text).map_err(|_| anyhow!("model returned no answer"))?;
            }

            if iterations >= self.max_tool_iterations {
                bail!(
                    "model kept requesting tools after {} iterations",
                    self.max_tool_iterations
                );
            }
            iterations += 1;

            for call in response.tool_calls {
                tracing::debug!(tool = %call.name, call_id = %call.id, "Executing tool call");
                let result = self.tools.dispatch(&call).await;
                turn.push(Message::tool_use(call));
                turn.push(Message::tool_result(result));
            }
        };

        let text = answer.as_str().to_string();
        turn.push(Message::assistant(answer));
        self.history.extend(turn.iter().cloned());

        if let Some(memory) = &self.memory {
            memory.spawn_after_inference(turn);
        }

        Ok(text)
    }

    /// `name=value` summary of saved values, after any pending merge.
    pub async fn memory_status(&self) -> Option<String> {
        let memory = self.memory.as_ref()?;
        memory.wait_pending().await;
        let store = memory.snapshot().await;
        (!store.saved_values().is_empty()).then(|| store.saved_values_summary())
    }

    /// Write the session file, if one is configured.
    pub async fn save_session(&self) -> Result<()> {
        let (Some(memory), Some(path)) = (&self.memory, &self.session_path) else {
            return Ok(());
        };
        memory.wait_pending().await;
        let store = memory.snapshot().await;
        save_session(path, &store)
            .with_context(|| format!("failed to save session to {}", path.display()))
    }

    /// Wait for background work and persist the session.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            memory.wait_pending().await;
        }
        self.save_session().await
    }
}
