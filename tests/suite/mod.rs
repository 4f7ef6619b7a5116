mod agent_turn;
mod memory_session;
mod provider;
