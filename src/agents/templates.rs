//! LLM-backed agents defined by a prompt template.
//!
//! `{request}` in a template is replaced by the (trimmed) request text.

use super::{require_request, Agent, AgentError, PromptAgent};

#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub role: &'static str,
    pub profile: &'static str,
    pub description: &'static str,
    pub template: &'static str,
}

const PLACEHOLDER: &str = "{request}";

pub const PROMPT_TEMPLATES: &[PromptTemplate] = &[
    // Productivity
    PromptTemplate {
        role: "Writing-Agent",
        profile: "Productivity",
        description: "Writes and summarizes text",
        template: "You are a professional writer. Write a clear, well-structured response about the following topic:\n\nTopic: \"{request}\"",
    },
    PromptTemplate {
        role: "Teacher-Agent",
        profile: "Productivity",
        description: "Explains concepts",
        template: "You are an experienced teacher. Explain the following concept in a clear and concise way:\n\nConcept: \"{request}\"",
    },
    PromptTemplate {
        role: "Financial-Agent",
        profile: "Productivity",
        description: "Analyzes financial data",
        template: "You are a financial analyst. Analyze the following data and provide a summary of key insights:\n\nData: \"{request}\"",
    },
    // Developer
    PromptTemplate {
        role: "Architect-Agent",
        profile: "Developer",
        description: "Produces high-level technical designs",
        template: "You are an expert software architect. Create a high-level technical design for the following requirement:\n\nRequirement: \"{request}\"\n\nThe design should include:\n1. Key components and their responsibilities.\n2. Data models and schemas.\n3. API endpoints (if applicable).\n4. Technology stack recommendations.",
    },
    PromptTemplate {
        role: "Deep-Coder-Agent",
        profile: "Developer",
        description: "Writes robust, tested implementations",
        template: "You are a senior software engineer. Write a robust, scalable, and well-tested implementation for the following task:\n\nTask: \"{request}\"\n\nInclude error handling and unit tests.",
    },
    PromptTemplate {
        role: "Fast-Coder-Agent",
        profile: "Developer",
        description: "Writes small functions quickly",
        template: "Write a concise function to {request}. Return only the code.",
    },
    PromptTemplate {
        role: "Debug-Agent",
        profile: "Developer",
        description: "Finds and fixes bugs",
        template: "You are an expert software debugger. Analyze the following code or error report and provide a corrected version with an explanation of the fix:\n\n{request}",
    },
    PromptTemplate {
        role: "QA-Agent",
        profile: "Developer",
        description: "Reviews code for bugs and style",
        template: "You are a senior quality assurance engineer. Review the following code for bugs, style issues, and potential improvements:\n\n{request}\n\nProvide your feedback in a structured format, including:\n1. Bugs found.\n2. Style issues.\n3. Suggested improvements.",
    },
    PromptTemplate {
        role: "Research-Agent",
        profile: "Developer",
        description: "Summarizes a research topic",
        template: "You are a research assistant. Your task is to provide a comprehensive summary of the following topic:\n\nTopic: \"{request}\"\n\nPlease include key concepts, relevant technologies, and potential challenges.",
    },
    // Transversal
    PromptTemplate {
        role: "Document-Management-Agent",
        profile: "Transversal",
        description: "Summarizes documents",
        template: "You are a professional summarizer. Summarize the following document:\n\nDocument: \"{request}\"",
    },
    PromptTemplate {
        role: "Email-Management-Agent",
        profile: "Transversal",
        description: "Drafts emails",
        template: "You are a professional email writer. Compose an email based on the following request:\n\n\"{request}\"",
    },
    PromptTemplate {
        role: "Excel-Agent",
        profile: "Transversal",
        description: "Writes Excel VBA macros",
        template: "You are an expert in Excel VBA. Write a VBA macro to accomplish the following task:\n\nTask: \"{request}\"\n\nPlease provide only the VBA code, without any additional explanations or markdown formatting.",
    },
    PromptTemplate {
        role: "Personal-Trainer-Agent",
        profile: "Transversal",
        description: "Builds workout plans",
        template: "You are a certified personal trainer. Create a weekly workout plan for the following goal and fitness level:\n\n\"{request}\"\n\nThe plan should include a variety of exercises, sets, and reps.",
    },
    PromptTemplate {
        role: "Photo-Management-Agent",
        profile: "Transversal",
        description: "Plans photo organization",
        template: "You are a professional photo organizer. Create a plan to organize photos based on the following criteria:\n\nCriteria: \"{request}\"",
    },
];

#[derive(Debug, Clone)]
pub struct PromptTemplateAgent {
    template: PromptTemplate,
}

impl PromptTemplateAgent {
    pub fn new(template: &PromptTemplate) -> Self {
        Self {
            template: *template,
        }
    }
}

impl Agent for PromptTemplateAgent {
    fn role(&self) -> &str {
        self.template.role
    }

    fn profile(&self) -> &str {
        self.template.profile
    }

    fn description(&self) -> &str {
        self.template.description
    }
}

impl PromptAgent for PromptTemplateAgent {
    fn build_prompt(&self, request: &str) -> Result<String, AgentError> {
        let request = require_request(self.role(), request)?;
        Ok(self.template.template.replace(PLACEHOLDER, request))
    }
}
