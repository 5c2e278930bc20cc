//! # ai-agent-server
//!
//! Task router that classifies natural-language requests and dispatches them
//! to conversational, planning or LLM-backed agents.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP POST /tasks
//!          │
//!          ▼
//!   ┌─────────────┐   tasks.inbound   ┌──────────────┐
//!   │  Dispatcher │ ────────────────► │  MessageBus  │
//!   │   submit    │ ◄──────────────── │  (consumer)  │
//!   └──────┬──────┘   tasks.feedback  └──────────────┘
//!          │
//!    Classifier ──► Chat / Plan inline
//!          │
//!          └──► Agent ──► LoadBalancer ──► TextGenerator (Ollama / OpenAI)
//!
//!   every state change ──► TaskStore (active/ → history/)
//! ```
//!
//! ## Modules
//! - `classifier`: keyword table mapping a prompt to nature, mode and role
//! - `load_balancer`: rule-driven engine selection
//! - `llm`: backend clients and the engine registry
//! - `agents`: agent capabilities and the role registry
//! - `task_state`: task records with per-task locking, in memory or on disk
//! - `bus`: durable queues with explicit acknowledgements
//! - `dispatch`: the request pipeline tying the above together
//! - `api`: HTTP surface

pub mod agents;
pub mod api;
pub mod bus;
pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod llm;
pub mod load_balancer;
pub mod metrics;
pub mod task_state;

pub use config::Config;
pub use dispatch::{Dispatcher, DispatchError};
