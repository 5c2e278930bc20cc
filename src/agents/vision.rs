//! Placeholder vision agent: no image is actually read.

use super::{require_request, Agent, AgentError, LocalAgent};

#[derive(Debug, Default)]
pub struct VisionAgent;

impl VisionAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for VisionAgent {
    fn role(&self) -> &str {
        "Vision-Agent"
    }

    fn profile(&self) -> &str {
        "Developer"
    }

    fn description(&self) -> &str {
        "Describes an image given its path (stub)"
    }
}

impl LocalAgent for VisionAgent {
    fn respond(&self, request: &str) -> Result<String, AgentError> {
        let path = require_request(self.role(), request)?;
        Ok(format!("Description of the image at {}", path))
    }
}
