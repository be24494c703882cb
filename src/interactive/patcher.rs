//! Canned answers for code that asks questions under test

use super::question::{Answer, Question};
use super::Asker;
use crate::error::PromptError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A prepared response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bool(bool),
    /// Parsed like typed input: text, choice name or number
    Text(String),
    /// Choice names for a multi-select
    Choices(Vec<String>),
}

impl From<bool> for Response {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Response {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Response {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<S: Into<String>> From<Vec<S>> for Response {
    fn from(values: Vec<S>) -> Self {
        Self::Choices(values.into_iter().map(Into::into).collect())
    }
}

impl Response {
    fn answer(&self, question: &Question) -> Result<Answer, PromptError> {
        match (self, question) {
            (Self::Bool(value), Question::Confirm { .. }) => Ok(Answer::Confirm(*value)),
            (Self::Bool(value), _) => Err(question.invalid(&value.to_string(), "not a yes/no question")),
            (Self::Text(text), _) => question.parse_response(text),
            (Self::Choices(names), Question::SelectMultiple { .. }) => question.parse_response(&names.join(",")),
            (Self::Choices(names), _) => Err(question.invalid(&names.join(","), "not a multi-select question")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PromptPattern {
    Contains(String),
    Exact(String),
}

/// Response given whenever a prompt matches
#[derive(Debug, Clone)]
pub struct PromptMatch {
    pattern: PromptPattern,
    response: Response,
    max_matches: usize,
    matches: usize,
}

impl PromptMatch {
    /// Matches prompts containing `substring`
    pub fn contains(substring: impl Into<String>, response: impl Into<Response>) -> Self {
        Self::new(PromptPattern::Contains(substring.into()), response.into())
    }

    /// Matches the prompt `prompt` exactly
    pub fn exact(prompt: impl Into<String>, response: impl Into<Response>) -> Self {
        Self::new(PromptPattern::Exact(prompt.into()), response.into())
    }

    fn new(pattern: PromptPattern, response: Response) -> Self {
        Self {
            pattern,
            response,
            max_matches: 1,
            matches: 0,
        }
    }

    /// How often this response may be used, 1 by default
    pub fn max_matches(mut self, max: usize) -> Self {
        self.max_matches = max;
        self
    }

    fn take(&mut self, prompt: &str) -> Option<Response> {
        if self.matches >= self.max_matches {
            return None;
        }
        let matched = match &self.pattern {
            PromptPattern::Contains(substring) => prompt.contains(substring.as_str()),
            PromptPattern::Exact(exact) => prompt == exact,
        };
        if !matched {
            return None;
        }
        self.matches += 1;
        Some(self.response.clone())
    }
}

#[derive(Debug, Default)]
struct PatcherState {
    responses: VecDeque<Response>,
    expected: usize,
    dynamic: Vec<PromptMatch>,
    asked: Vec<String>,
}

/// [`Asker`] answering from prepared responses.
///
/// Prompt matches are consulted first, then the queue in order. Clones share
/// their state, so a test can keep one clone to inspect what was asked.
#[derive(Debug, Clone, Default)]
pub struct QuestionPatcher {
    state: Arc<Mutex<PatcherState>>,
}

impl QuestionPatcher {
    pub fn new<I, R>(responses: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Response>,
    {
        let responses: VecDeque<Response> = responses.into_iter().map(Into::into).collect();
        let state = PatcherState {
            expected: responses.len(),
            responses,
            ..PatcherState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_match(self, prompt_match: PromptMatch) -> Self {
        self.lock().dynamic.push(prompt_match);
        self
    }

    /// Prompts asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.lock().asked.clone()
    }

    pub fn remaining(&self) -> usize {
        self.lock().responses.len()
    }

    fn lock(&self) -> MutexGuard<'_, PatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Asker for QuestionPatcher {
    fn ask(&mut self, question: &Question) -> Result<Answer, PromptError> {
        let prompt = question.prompt();
        let response = {
            let mut state = self.lock();
            state.asked.push(prompt.to_string());
            let dynamic = state.dynamic.iter_mut().find_map(|m| m.take(prompt));
            match dynamic.or_else(|| state.responses.pop_front()) {
                Some(response) => response,
                None => {
                    return Err(PromptError::OutOfResponses {
                        expected: state.expected,
                        asked: state.asked.len(),
                        prompt: prompt.to_string(),
                    })
                }
            }
        };
        response.answer(question)
    }
}
