//! Context assembler: builds the bounded prompt sent to the generator.
//!
//! The prompt has four parts, always in this order:
//!
//! 1. the system instruction followed by the reference-material preamble,
//! 2. retrieved chunks in rank order, each tagged with its source label,
//! 3. prior conversation messages in chronological order,
//! 4. the current query.
//!
//! The whole rendered prompt never exceeds [`PromptBudget::max_chars`]
//! characters. Parts 1 and 4 are mandatory. Retrieved chunks claim the
//! remaining space first, lowest-ranked dropped first; history gets what is
//! left, oldest dropped first.
//!
//! [`ContextAssembler::assemble`] is pure: identical inputs always give an
//! identical prompt.

use crate::config::PromptConfig;
use crate::error::RagError;
use crate::models::{Message, RetrievalResult, Role};

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a knowledgeable assistant answering questions \
from a private document collection.

Use the provided context from the knowledge base as the primary source of truth. \
If the context is not sufficient, you may use general knowledge, but clearly state any assumptions.

Always use simple, practical language and connect explanations to concrete examples.";

pub const REFERENCE_PREAMBLE: &str = "Use the following reference material to answer. \
If there is any conflict, prefer the reference material.";

const CHUNK_SEPARATOR: &str = "\n\n---\n\n";
const NO_CONTEXT: &str = "(no matching reference material)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    /// Upper bound on the rendered prompt, in characters.
    pub max_chars: usize,
    /// Upper bound on prior messages carried into the prompt.
    pub max_history_messages: usize,
}

impl From<&PromptConfig> for PromptBudget {
    fn from(config: &PromptConfig) -> Self {
        Self {
            max_chars: config.budget_chars,
            max_history_messages: config.history_messages,
        }
    }
}

/// An assembled prompt. Generation backends use the structured parts;
/// [`Prompt::render`] is the single-string form the budget is measured on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Instruction, preamble and retrieved context.
    pub system: String,
    /// Prior user/assistant messages, oldest first.
    pub history: Vec<Message>,
    pub query: String,
    pub chunks_used: usize,
    pub chunks_dropped: usize,
    pub history_dropped: usize,
}

impl Prompt {
    pub fn render(&self) -> String {
        render_parts(&self.system, &self.history, &self.query)
    }

    pub fn char_len(&self) -> usize {
        self.render().chars().count()
    }
}

fn render_parts(system: &str, history: &[Message], query: &str) -> String {
    let mut out = String::with_capacity(system.len() + query.len() + 64);
    out.push_str(system);
    out.push_str("\n\n");
    for message in history {
        out.push_str(speaker(message.role));
        out.push_str(": ");
        out.push_str(&message.content);
        out.push_str("\n\n");
    }
    out.push_str("User: ");
    out.push_str(query);
    out
}

fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    instruction: String,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_INSTRUCTION)
    }
}

impl ContextAssembler {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }

    pub fn from_config(config: &PromptConfig) -> Self {
        match &config.system_instruction {
            Some(instruction) => Self::new(instruction.clone()),
            None => Self::default(),
        }
    }

    /// Build the prompt for `query`.
    ///
    /// `history` is the conversation before this turn. System messages in it
    /// are ignored; the instruction is fixed per assembler. Fails with
    /// [`RagError::BadRequest`] when the instruction and query alone do not
    /// fit the budget.
    pub fn assemble(
        &self,
        query: &str,
        retrieved: &RetrievalResult,
        history: &[Message],
        budget: &PromptBudget,
    ) -> Result<Prompt, RagError> {
        let fits = |system: &str, history: &[Message]| {
            render_parts(system, history, query).chars().count() <= budget.max_chars
        };

        let bare = self.system_text(&[]);
        if !fits(&bare, &[]) {
            return Err(RagError::BadRequest(format!(
                "query does not fit the prompt budget of {} characters",
                budget.max_chars
            )));
        }

        let mut sections: Vec<String> = Vec::new();
        let mut system = bare;
        for hit in &retrieved.hits {
            sections.push(format!("[source: {}]\n{}", hit.entry.source, hit.entry.text));
            let candidate = self.system_text(&sections);
            if !fits(&candidate, &[]) {
                sections.pop();
                break;
            }
            system = candidate;
        }
        let chunks_used = sections.len();

        let eligible: Vec<&Message> = history.iter().filter(|m| m.role != Role::System).collect();
        let window_start = eligible.len().saturating_sub(budget.max_history_messages);
        let mut kept: Vec<Message> = Vec::new();
        for message in eligible[window_start..].iter().rev() {
            kept.insert(0, (*message).clone());
            if !fits(&system, &kept) {
                kept.remove(0);
                break;
            }
        }

        Ok(Prompt {
            system,
            history_dropped: eligible.len() - kept.len(),
            history: kept,
            query: query.to_string(),
            chunks_used,
            chunks_dropped: retrieved.len() - chunks_used,
        })
    }

    fn system_text(&self, sections: &[String]) -> String {
        let context = if sections.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            sections.join(CHUNK_SEPARATOR)
        };
        format!(
            "{}\n\n{}\n\nContext:\n{}",
            self.instruction, REFERENCE_PREAMBLE, context
        )
    }
}
