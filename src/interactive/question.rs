//! Questions, answers and the parsing of typed responses

use crate::error::PromptError;

/// A question put to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    Confirm {
        prompt: String,
        default: Option<bool>,
    },
    Text {
        prompt: String,
        default: Option<String>,
    },
    Select {
        prompt: String,
        choices: Vec<String>,
        default: Option<usize>,
    },
    SelectMultiple {
        prompt: String,
        choices: Vec<String>,
        defaults: Vec<usize>,
    },
}

/// Answer to a [`Question`], choices are returned as indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Confirm(bool),
    Text(String),
    Select(usize),
    SelectMultiple(Vec<usize>),
}

impl Question {
    pub fn prompt(&self) -> &str {
        match self {
            Self::Confirm { prompt, .. }
            | Self::Text { prompt, .. }
            | Self::Select { prompt, .. }
            | Self::SelectMultiple { prompt, .. } => prompt,
        }
    }

    pub fn choices(&self) -> &[String] {
        match self {
            Self::Select { choices, .. } | Self::SelectMultiple { choices, .. } => choices,
            _ => &[],
        }
    }

    /// Answer used when nobody can be asked
    pub fn default_answer(&self) -> Option<Answer> {
        match self {
            Self::Confirm { default, .. } => default.map(Answer::Confirm),
            Self::Text { default, .. } => default.clone().map(Answer::Text),
            Self::Select { default, .. } => default.map(Answer::Select),
            Self::SelectMultiple { defaults, .. } => Some(Answer::SelectMultiple(defaults.clone())),
        }
    }

    /// Interpret a typed response.
    ///
    /// An empty response selects the default. Choices accept their 1-based
    /// number or their exact text; multiple choices are comma separated.
    pub fn parse_response(&self, response: &str) -> Result<Answer, PromptError> {
        let response = response.trim();
        if response.is_empty() {
            return self
                .default_answer()
                .ok_or_else(|| self.invalid(response, "an answer is required"));
        }

        match self {
            Self::Confirm { .. } => match response.to_lowercase().as_str() {
                "y" | "yes" | "true" => Ok(Answer::Confirm(true)),
                "n" | "no" | "false" => Ok(Answer::Confirm(false)),
                _ => Err(self.invalid(response, "expected yes or no")),
            },
            Self::Text { .. } => Ok(Answer::Text(response.to_string())),
            Self::Select { choices, .. } => self.find_choice(choices, response).map(Answer::Select),
            Self::SelectMultiple { choices, .. } => response
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| self.find_choice(choices, part))
                .collect::<Result<Vec<_>, _>>()
                .map(Answer::SelectMultiple),
        }
    }

    fn find_choice(&self, choices: &[String], response: &str) -> Result<usize, PromptError> {
        if let Some(index) = choices.iter().position(|choice| choice == response) {
            return Ok(index);
        }
        match response.parse::<usize>() {
            Ok(number) if (1..=choices.len()).contains(&number) => Ok(number - 1),
            _ => Err(self.invalid(response, &format!("choose one of: {}", choices.join(", ")))),
        }
    }

    pub(crate) fn invalid(&self, response: &str, reason: &str) -> PromptError {
        PromptError::InvalidResponse {
            prompt: self.prompt().to_string(),
            response: response.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Selectable entry carrying a typed value, shown by its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice<T> {
    pub name: String,
    pub value: T,
}

impl<T> Choice<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(default: Option<usize>) -> Question {
        Question::Select {
            prompt: "env?".to_string(),
            choices: vec!["dev".to_string(), "prod".to_string()],
            default,
        }
    }

    #[test]
    fn test_confirm_responses() {
        let question = Question::Confirm {
            prompt: "continue?".to_string(),
            default: Some(false),
        };
        assert_eq!(question.parse_response("Y").unwrap(), Answer::Confirm(true));
        assert_eq!(question.parse_response("no").unwrap(), Answer::Confirm(false));
        assert_eq!(question.parse_response("").unwrap(), Answer::Confirm(false));
        assert!(matches!(
            question.parse_response("perhaps"),
            Err(PromptError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_select_by_text_or_number() {
        let question = select(None);
        assert_eq!(question.parse_response("prod").unwrap(), Answer::Select(1));
        assert_eq!(question.parse_response("1").unwrap(), Answer::Select(0));
        assert!(question.parse_response("3").is_err());
        assert!(question.parse_response("").is_err());
        assert_eq!(select(Some(1)).parse_response("").unwrap(), Answer::Select(1));
    }

    #[test]
    fn test_select_multiple() {
        let question = Question::SelectMultiple {
            prompt: "targets?".to_string(),
            choices: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            defaults: vec![2],
        };
        assert_eq!(
            question.parse_response("a, 2").unwrap(),
            Answer::SelectMultiple(vec![0, 1])
        );
        assert_eq!(question.parse_response(" ").unwrap(), Answer::SelectMultiple(vec![2]));
    }
}
