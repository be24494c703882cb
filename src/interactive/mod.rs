//! Interactive prompts - confirm, text and select questions
//!
//! Questions go through a [`Prompter`], which decides by its [`PromptMode`]
//! whether to ask, answer from defaults or fail. The console is paused while
//! a question is on screen.

mod patcher;
mod question;
mod terminal;

pub use patcher::{PromptMatch, QuestionPatcher, Response};
pub use question::{Answer, Choice, Question};
pub use terminal::TerminalAsker;

use crate::console::Console;
use crate::error::PromptError;
use crate::settings::{parse_flag, AskShellSettings};
use std::io::IsTerminal;
use std::sync::Mutex;

/// Something that can answer questions
pub trait Asker: Send {
    fn ask(&mut self, question: &Question) -> Result<Answer, PromptError>;
}

/// How questions are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Interactive,
    /// Never block: use the default or fail with [`PromptError::NoDefault`]
    NonInteractive,
    /// Fail every question with [`PromptError::RaiseOnQuestion`]
    RaiseOnQuestion,
}

impl PromptMode {
    /// Mode for the current process
    pub fn detect(settings: &AskShellSettings) -> Self {
        Self::detect_with(settings, std::io::stdout().is_terminal(), |name| {
            std::env::var(name).ok()
        })
    }

    pub fn detect_with<F>(settings: &AskShellSettings, stdout_is_tty: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if settings.raise_on_question {
            return Self::RaiseOnQuestion;
        }
        if settings.force_interactive {
            return Self::Interactive;
        }

        let dumb_term = matches!(lookup("TERM").as_deref(), Some("dumb") | Some("unknown"));
        let in_ci = lookup("CI").is_some_and(|value| parse_flag("CI", &value).unwrap_or(true));
        let mode = if !stdout_is_tty || dumb_term || in_ci {
            Self::NonInteractive
        } else {
            Self::Interactive
        };
        log::debug!(
            "Prompt mode {:?} (tty={}, dumb_term={}, ci={})",
            mode,
            stdout_is_tty,
            dumb_term,
            in_ci
        );
        mode
    }
}

/// Entry point for questions
pub struct Prompter {
    mode: PromptMode,
    asker: Mutex<Box<dyn Asker>>,
    console: Option<Console>,
}

impl std::fmt::Debug for Prompter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompter").field("mode", &self.mode).finish()
    }
}

impl Prompter {
    pub fn new(mode: PromptMode, asker: impl Asker + 'static) -> Self {
        Self {
            mode,
            asker: Mutex::new(Box::new(asker)),
            console: None,
        }
    }

    /// Terminal prompter with the mode detected from `settings`
    pub fn from_settings(settings: &AskShellSettings) -> Self {
        Self::new(
            PromptMode::detect(settings),
            TerminalAsker::new(settings.search_enabled_after_choices),
        )
    }

    /// Pause `console` while a question is asked
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn with_mode(mut self, mode: PromptMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PromptMode {
        self.mode
    }

    pub fn ask(&self, question: Question) -> Result<Answer, PromptError> {
        match self.mode {
            PromptMode::RaiseOnQuestion => Err(PromptError::RaiseOnQuestion {
                prompt: question.prompt().to_string(),
            }),
            PromptMode::NonInteractive => {
                question.default_answer().ok_or_else(|| PromptError::NoDefault {
                    prompt: question.prompt().to_string(),
                })
            }
            PromptMode::Interactive => {
                let _pause = self.console.as_ref().map(Console::pause);
                let mut asker = self.asker.lock().unwrap_or_else(|e| e.into_inner());
                asker.ask(&question)
            }
        }
    }

    pub fn confirm(&self, prompt: &str, default: Option<bool>) -> Result<bool, PromptError> {
        let question = Question::Confirm {
            prompt: prompt.to_string(),
            default,
        };
        match self.ask(question.clone())? {
            Answer::Confirm(value) => Ok(value),
            other => Err(mismatch(&question, &other)),
        }
    }

    pub fn text(&self, prompt: &str, default: Option<&str>) -> Result<String, PromptError> {
        let question = Question::Text {
            prompt: prompt.to_string(),
            default: default.map(str::to_string),
        };
        match self.ask(question.clone())? {
            Answer::Text(value) => Ok(value),
            other => Err(mismatch(&question, &other)),
        }
    }

    /// Pick one of `choices`, returning the chosen text
    pub fn select<S: AsRef<str>>(
        &self,
        prompt: &str,
        choices: &[S],
        default: Option<&str>,
    ) -> Result<String, PromptError> {
        let choices: Vec<String> = choices.iter().map(|c| c.as_ref().to_string()).collect();
        let default = default.and_then(|d| choices.iter().position(|c| c == d));
        let question = Question::Select {
            prompt: prompt.to_string(),
            choices,
            default,
        };
        match self.ask(question.clone())? {
            Answer::Select(index) if index < question.choices().len() => {
                Ok(question.choices()[index].clone())
            }
            other => Err(mismatch(&question, &other)),
        }
    }

    /// Pick any subset of `choices`, returning the chosen texts in list order
    pub fn select_multiple<S: AsRef<str>>(
        &self,
        prompt: &str,
        choices: &[S],
        defaults: &[&str],
    ) -> Result<Vec<String>, PromptError> {
        let choices: Vec<String> = choices.iter().map(|c| c.as_ref().to_string()).collect();
        let defaults = choices
            .iter()
            .enumerate()
            .filter(|(_, c)| defaults.contains(&c.as_str()))
            .map(|(i, _)| i)
            .collect();
        let question = Question::SelectMultiple {
            prompt: prompt.to_string(),
            choices,
            defaults,
        };
        match self.ask(question.clone())? {
            Answer::SelectMultiple(mut indices)
                if indices.iter().all(|i| *i < question.choices().len()) =>
            {
                indices.sort_unstable();
                indices.dedup();
                Ok(indices
                    .into_iter()
                    .map(|i| question.choices()[i].clone())
                    .collect())
            }
            other => Err(mismatch(&question, &other)),
        }
    }

    /// Pick one of `choices` by name, returning its value.
    ///
    /// `default` names the choice used when nobody can be asked.
    pub fn select_choice<T>(
        &self,
        prompt: &str,
        choices: Vec<Choice<T>>,
        default: Option<&str>,
    ) -> Result<T, PromptError> {
        let names: Vec<String> = choices.iter().map(|choice| choice.name.clone()).collect();
        let question = Question::Select {
            prompt: prompt.to_string(),
            default: default.and_then(|d| names.iter().position(|name| name == d)),
            choices: names,
        };
        if choices.is_empty() {
            return Err(question.invalid("", "no choices to select from"));
        }
        match self.ask(question.clone())? {
            Answer::Select(index) if index < choices.len() => choices
                .into_iter()
                .nth(index)
                .map(|choice| choice.value)
                .ok_or_else(|| mismatch(&question, &Answer::Select(index))),
            other => Err(mismatch(&question, &other)),
        }
    }

    /// Pick one key of `entries`, in iteration order, returning the mapped value
    pub fn select_map<K, T, I>(&self, prompt: &str, entries: I, default: Option<&str>) -> Result<T, PromptError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        let choices = entries
            .into_iter()
            .map(|(key, value)| Choice::new(key, value))
            .collect();
        self.select_choice(prompt, choices, default)
    }
}

fn mismatch(question: &Question, answer: &Answer) -> PromptError {
    question.invalid(&format!("{:?}", answer), "answer does not fit the question")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturedOutput;

    fn settings() -> AskShellSettings {
        AskShellSettings::default()
    }

    #[test]
    fn test_detect_modes() {
        let none = |_: &str| None;
        assert_eq!(PromptMode::detect_with(&settings(), true, none), PromptMode::Interactive);
        assert_eq!(PromptMode::detect_with(&settings(), false, none), PromptMode::NonInteractive);

        let ci = |name: &str| (name == "CI").then(|| "true".to_string());
        assert_eq!(PromptMode::detect_with(&settings(), true, ci), PromptMode::NonInteractive);
        let dumb = |name: &str| (name == "TERM").then(|| "dumb".to_string());
        assert_eq!(PromptMode::detect_with(&settings(), true, dumb), PromptMode::NonInteractive);

        let forced = AskShellSettings {
            force_interactive: true,
            ..settings()
        };
        assert_eq!(PromptMode::detect_with(&forced, false, ci), PromptMode::Interactive);

        let raising = AskShellSettings {
            raise_on_question: true,
            force_interactive: true,
            ..settings()
        };
        assert_eq!(PromptMode::detect_with(&raising, true, none), PromptMode::RaiseOnQuestion);
    }

    #[test]
    fn test_non_interactive_uses_defaults() {
        let prompter = Prompter::new(PromptMode::NonInteractive, QuestionPatcher::default());
        assert!(prompter.confirm("continue?", Some(true)).unwrap());
        assert_eq!(prompter.text("name?", Some("ask")).unwrap(), "ask");
        assert_eq!(
            prompter.select("env?", &["dev", "prod"], Some("prod")).unwrap(),
            "prod"
        );
        assert_eq!(
            prompter.select_multiple("targets?", &["a", "b"], &["b"]).unwrap(),
            vec!["b"]
        );

        let err = prompter.confirm("really?", None).unwrap_err();
        assert!(matches!(err, PromptError::NoDefault { .. }));
    }

    #[test]
    fn test_raise_on_question() {
        let prompter = Prompter::new(PromptMode::RaiseOnQuestion, QuestionPatcher::new([true]));
        let err = prompter.confirm("hello error", Some(true)).unwrap_err();
        assert_eq!(err.to_string(), "Question asked: 'hello error'");
    }

    #[test]
    fn test_interactive_with_patcher() {
        let patcher = QuestionPatcher::new(vec![
            Response::from(false),
            Response::from("my-name"),
            Response::from("2"),
            Response::from(vec!["c", "a"]),
        ]);
        let prompter = Prompter::new(PromptMode::Interactive, patcher.clone());

        assert!(!prompter.confirm("continue?", Some(true)).unwrap());
        assert_eq!(prompter.text("name?", None).unwrap(), "my-name");
        assert_eq!(prompter.select("env?", &["dev", "prod"], None).unwrap(), "prod");
        assert_eq!(
            prompter.select_multiple("pick?", &["a", "b", "c"], &[]).unwrap(),
            vec!["a", "c"]
        );
        assert_eq!(patcher.asked(), vec!["continue?", "name?", "env?", "pick?"]);
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Region {
        Eu,
        Us,
        Ap,
    }

    fn regions() -> Vec<Choice<Region>> {
        vec![
            Choice::new("eu-west-1", Region::Eu),
            Choice::new("us-east-1", Region::Us),
            Choice::new("ap-south-1", Region::Ap),
        ]
    }

    #[test]
    fn test_select_choice_returns_value() {
        let patcher = QuestionPatcher::new(["us-east-1", "3"]);
        let prompter = Prompter::new(PromptMode::Interactive, patcher.clone());

        assert_eq!(prompter.select_choice("region?", regions(), None).unwrap(), Region::Us);
        assert_eq!(prompter.select_choice("region?", regions(), None).unwrap(), Region::Ap);
        assert_eq!(patcher.remaining(), 0);
    }

    #[test]
    fn test_select_choice_default_and_empty() {
        let prompter = Prompter::new(PromptMode::NonInteractive, QuestionPatcher::default());
        assert_eq!(
            prompter.select_choice("region?", regions(), Some("eu-west-1")).unwrap(),
            Region::Eu
        );

        let err = prompter.select_choice("region?", regions(), None).unwrap_err();
        assert!(matches!(err, PromptError::NoDefault { .. }));

        let err = prompter
            .select_choice::<Region>("region?", Vec::new(), None)
            .unwrap_err();
        assert!(matches!(err, PromptError::InvalidResponse { .. }));
    }

    #[test]
    fn test_select_map_keeps_entry_order() {
        let patcher = QuestionPatcher::new(["2"]).with_match(PromptMatch::contains("size", "large"));
        let prompter = Prompter::new(PromptMode::Interactive, patcher);

        let replicas = [("small", 1u32), ("medium", 3), ("large", 5)];
        assert_eq!(prompter.select_map("replicas?", replicas, None).unwrap(), 3);

        let mut sizes = std::collections::BTreeMap::new();
        sizes.insert("large".to_string(), 64u32);
        sizes.insert("small".to_string(), 8);
        assert_eq!(prompter.select_map("instance size?", sizes, None).unwrap(), 64);
    }

    struct PauseCheck {
        console: Console,
        output: CapturedOutput,
    }

    impl Asker for PauseCheck {
        fn ask(&mut self, _question: &Question) -> Result<Answer, PromptError> {
            self.console.line("during");
            Ok(Answer::Confirm(!self.output.contents().contains("during")))
        }
    }

    #[test]
    fn test_console_is_paused_while_asking() {
        let (console, output) = Console::capture();
        let check = PauseCheck {
            console: console.clone(),
            output: output.clone(),
        };
        let prompter = Prompter::new(PromptMode::Interactive, check).with_console(console.clone());

        console.line("before");
        assert!(prompter.confirm("ok?", None).unwrap());
        assert_eq!(output.contents(), "before\nduring\n");
    }
}
