//! Chat orchestrator.
//!
//! Runs one conversation turn as
//! `Idle → Retrieving → Assembling → Generating → Complete`, entering
//! `Failed` from any working state. A failed turn leaves the conversation
//! exactly as it was; a completed turn appends the user message and then the
//! assistant message.
//!
//! Two entry points share the same pipeline:
//!
//! - [`ChatOrchestrator::respond`] is stateless: the caller sends the whole
//!   conversation each turn and gets back the new assistant message.
//! - [`ChatOrchestrator::turn`] drives a [`ChatSession`] that owns its
//!   [`Conversation`].

use crate::error::{ChatError, RagError};
use crate::generate::AnswerGenerator;
use crate::models::{Conversation, Message, Role};
use crate::prompt::{ContextAssembler, PromptBudget};
use crate::retrieve::Retriever;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Retrieving,
    Assembling,
    Generating,
    Complete,
    Failed,
}

/// One user's conversation plus the state of its latest turn.
#[derive(Debug, Clone)]
pub struct ChatSession {
    conversation: Conversation,
    state: TurnState,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            conversation: Conversation::new(),
            state: TurnState::Idle,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn reset(&mut self) {
        self.conversation = Conversation::new();
        self.state = TurnState::Idle;
    }
}

pub struct ChatOrchestrator {
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: AnswerGenerator,
    budget: PromptBudget,
    top_k: usize,
}

impl ChatOrchestrator {
    pub fn new(
        retriever: Retriever,
        assembler: ContextAssembler,
        generator: AnswerGenerator,
        budget: PromptBudget,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            assembler,
            generator,
            budget,
            top_k,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answer the last message of `messages`, using the rest as history.
    ///
    /// The last message must be a non-empty user message.
    pub async fn respond(&self, messages: &[Message]) -> Result<Message, ChatError> {
        let (latest, history) = match messages.split_last() {
            Some(split) => split,
            None => return Err(bad_request("conversation is empty")),
        };
        if latest.role != Role::User {
            return Err(bad_request(&format!(
                "last message must come from the user, not {}",
                latest.role.as_str()
            )));
        }
        if latest.content.trim().is_empty() {
            return Err(bad_request("message is empty"));
        }

        let mut state = TurnState::Idle;
        self.run(&latest.content, history, &mut state)
            .await
            .map(Message::assistant)
            .map_err(|e| ChatError::from(&e))
    }

    /// Run one turn of `session`.
    pub async fn turn(&self, session: &mut ChatSession, text: &str) -> Result<Message, ChatError> {
        if text.trim().is_empty() {
            session.state = TurnState::Failed;
            return Err(bad_request("message is empty"));
        }

        session.state = TurnState::Idle;
        let outcome = self
            .run(text, session.conversation.messages(), &mut session.state)
            .await;

        match outcome {
            Ok(answer) => {
                let reply = Message::assistant(answer);
                session
                    .conversation
                    .push_exchange(Message::user(text), reply.clone());
                Ok(reply)
            }
            Err(e) => Err(ChatError::from(&e)),
        }
    }

    async fn run(
        &self,
        query: &str,
        history: &[Message],
        state: &mut TurnState,
    ) -> Result<String, RagError> {
        let result = self.pipeline(query, history, state).await;
        match &result {
            Ok(_) => advance(state, TurnState::Complete),
            Err(e) => {
                tracing::warn!(failed_in = ?state, error = %e, "Chat turn failed");
                advance(state, TurnState::Failed);
            }
        }
        result
    }

    async fn pipeline(
        &self,
        query: &str,
        history: &[Message],
        state: &mut TurnState,
    ) -> Result<String, RagError> {
        advance(state, TurnState::Retrieving);
        let retrieved = self.retriever.retrieve(query, self.top_k).await?;

        advance(state, TurnState::Assembling);
        let prompt = self
            .assembler
            .assemble(query, &retrieved, history, &self.budget)?;
        tracing::debug!(
            chunks = prompt.chunks_used,
            chunks_dropped = prompt.chunks_dropped,
            history = prompt.history.len(),
            history_dropped = prompt.history_dropped,
            "Assembled prompt"
        );

        advance(state, TurnState::Generating);
        self.generator.generate(&prompt).await
    }
}

fn advance(state: &mut TurnState, next: TurnState) {
    tracing::debug!(from = ?*state, to = ?next, "Turn state");
    *state = next;
}

fn bad_request(reason: &str) -> ChatError {
    ChatError::from(&RagError::BadRequest(reason.to_string()))
}
