//! Terminal asker backed by dialoguer

use super::question::{Answer, Question};
use super::Asker;
use crate::error::PromptError;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, FuzzySelect, Input, MultiSelect, Select};

/// Asks on the controlling terminal.
///
/// Select questions with more than `search_after` choices switch from the
/// arrow/shortcut list to fuzzy search.
pub struct TerminalAsker {
    theme: ColorfulTheme,
    search_after: usize,
}

impl TerminalAsker {
    pub fn new(search_after: usize) -> Self {
        Self {
            theme: ColorfulTheme::default(),
            search_after,
        }
    }
}

fn prompt_error(question: &Question, error: dialoguer::Error) -> PromptError {
    match error {
        dialoguer::Error::IO(e) if e.kind() == std::io::ErrorKind::Interrupted => PromptError::Aborted {
            prompt: question.prompt().to_string(),
        },
        dialoguer::Error::IO(e) => PromptError::Io(e),
    }
}

impl Asker for TerminalAsker {
    fn ask(&mut self, question: &Question) -> Result<Answer, PromptError> {
        let aborted = || PromptError::Aborted {
            prompt: question.prompt().to_string(),
        };

        match question {
            Question::Confirm { prompt, default } => {
                let mut confirm = Confirm::with_theme(&self.theme).with_prompt(prompt);
                if let Some(default) = default {
                    confirm = confirm.default(*default);
                }
                confirm
                    .interact_opt()
                    .map_err(|e| prompt_error(question, e))?
                    .map(Answer::Confirm)
                    .ok_or_else(aborted)
            }
            Question::Text { prompt, default } => {
                let mut input = Input::<String>::with_theme(&self.theme).with_prompt(prompt);
                if let Some(default) = default {
                    input = input.default(default.clone());
                }
                input
                    .interact_text()
                    .map(Answer::Text)
                    .map_err(|e| prompt_error(question, e))
            }
            Question::Select {
                prompt,
                choices,
                default,
            } => {
                let selected = if choices.len() > self.search_after {
                    let mut select = FuzzySelect::with_theme(&self.theme)
                        .with_prompt(prompt)
                        .items(choices);
                    if let Some(default) = default {
                        select = select.default(*default);
                    }
                    select.interact_opt()
                } else {
                    let mut select = Select::with_theme(&self.theme)
                        .with_prompt(prompt)
                        .items(choices);
                    if let Some(default) = default {
                        select = select.default(*default);
                    }
                    select.interact_opt()
                };
                selected
                    .map_err(|e| prompt_error(question, e))?
                    .map(Answer::Select)
                    .ok_or_else(aborted)
            }
            Question::SelectMultiple {
                prompt,
                choices,
                defaults,
            } => {
                let checked: Vec<bool> = (0..choices.len()).map(|i| defaults.contains(&i)).collect();
                MultiSelect::with_theme(&self.theme)
                    .with_prompt(prompt)
                    .items(choices)
                    .defaults(&checked)
                    .interact_opt()
                    .map_err(|e| prompt_error(question, e))?
                    .map(Answer::SelectMultiple)
                    .ok_or_else(aborted)
            }
        }
    }
}
