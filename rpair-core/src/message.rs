//! Conversation transcript
//!
//! The transcript is the ordered, append-only record of everything the coder,
//! the executor and the human said during one run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The LLM writing R code
    Coder,
    /// Extracts and runs the coder's code, reports the result
    Executor,
    /// The person supplying the task and feedback
    Human,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coder => "coder",
            Role::Executor => "executor",
            Role::Human => "human",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn coder(text: impl Into<String>) -> Self {
        Self::new(Role::Coder, text)
    }

    pub fn executor(text: impl Into<String>) -> Self {
        Self::new(Role::Executor, text)
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(Role::Human, text)
    }

    /// Render as a console block, the way the CLI prints the conversation
    pub fn render(&self) -> String {
        format!("---------- {} ----------\n{}", self.role, self.text)
    }
}

/// Append-only message log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transcript with the task as the first human message
    pub fn seeded(task: impl Into<String>) -> Self {
        let mut transcript = Self::new();
        transcript.push(Message::human(task));
        transcript
    }

    pub fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The most recent message produced by `role`
    pub fn last_from(&self, role: Role) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == role)
    }

    pub fn count(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
