//! Dialogue management for conversational work over tables.
//!
//! Each user turn flows through a fixed loop:
//! 1. **Understanding** (`nlu`) - pattern, retrieval and model votes become one act prediction
//! 2. **Grounding** (`entities`) - table and column mentions are checked against the schema
//! 3. **Tracking** (`tracker`) - the belief state is committed and the flow stack updated
//! 4. **Guardrails** (`guardrails`) - refused or degraded requests stop here
//! 5. **Clarification** (`clarifier`) - open ambiguity becomes a question
//! 6. **Policy** (`policy`) - filled flows generate code and run it with bounded repair
//!
//! `runtime::AgentRuntime` drives the loop; `runtime::ConversationRegistry`
//! keeps one lock per conversation.
//!
//! The model only proposes. Act codes, slot contents and retry limits are
//! decided by deterministic code.

pub mod clarifier;
pub mod entities;
pub mod guardrails;
pub mod llm;
pub mod nlu;
pub mod policy;
pub mod prompts;
pub mod runtime;
pub mod tracker;

#[cfg(test)]
mod testing;
