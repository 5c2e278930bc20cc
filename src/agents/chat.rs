//! Rule-based conversational agent.

use super::{Agent, AgentError, LocalAgent};

const GREETING: &str = "Hello there! How can I assist you today?";
const WELLBEING: &str = "I'm a bot, so I don't have feelings, but I'm functioning as expected!";
const NAME: &str = "I am a Chat Agent, here to help with your conversational needs.";
const DEFAULT: &str = "That's an interesting point. Tell me more.";

#[derive(Debug, Default)]
pub struct ChatAgent;

impl ChatAgent {
    pub fn new() -> Self {
        Self
    }
}

fn is_greeting(lowered: &str) -> bool {
    // "hi" only as a whole word, so "this" is not a greeting
    lowered.contains("hello")
        || lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == "hi" || word == "hey")
}

impl Agent for ChatAgent {
    fn role(&self) -> &str {
        crate::classifier::CHAT_ROLE
    }

    fn profile(&self) -> &str {
        "General"
    }

    fn description(&self) -> &str {
        "Conversational replies for greetings and general questions"
    }
}

impl LocalAgent for ChatAgent {
    fn respond(&self, request: &str) -> Result<String, AgentError> {
        let lowered = request.to_lowercase();
        let reply = if is_greeting(&lowered) {
            GREETING
        } else if lowered.contains("how are you") {
            WELLBEING
        } else if lowered.contains("your name") {
            NAME
        } else {
            DEFAULT
        };
        Ok(reply.to_string())
    }
}
