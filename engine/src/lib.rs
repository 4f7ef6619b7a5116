//! Core engine for Tally: configuration and the conversation loop.
//!
//! This crate has no terminal dependencies; the CLI drives [`Agent`].

mod agent;
mod config;

pub use agent::{Agent, compose_instructions};
pub use config::{
    ApiKeys, AppConfig, ConfigError, DEFAULT_INSTRUCTIONS, DEFAULT_MAX_TOOL_ITERATIONS,
    MemoryConfig, OpenAIConfig, Settings, TallyConfig, config_path, expand_env_vars, tally_home,
};

pub use tally_context::{self, CalculatorMemory, FactStore};
pub use tally_providers::{self, ApiConfig, ChatBackend};
pub use tally_tools::{self, ToolRegistry};
pub use tally_types::{self, ApiKey, Message, ModelName};
