//! Interactive layer boundary.
//!
//! The core never reads stdin directly; every question goes through this
//! trait so the pipeline can be driven by a console in production and by a
//! scripted answer list in tests.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Blocking question/answer interface supplied by the caller.
pub trait Prompt {
    /// Ask a yes/no question. `default_yes` is used on empty input.
    fn confirm(&mut self, question: &str, default_yes: bool) -> bool;

    /// Ask for a free-form line of input.
    fn read_line(&mut self, question: &str) -> String;
}

/// Console implementation reading from stdin.
#[derive(Debug, Default)]
pub struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn confirm(&mut self, question: &str, default_yes: bool) -> bool {
        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        let answer = read_stdin_line(&format!("{question} {hint} "));
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => true,
            "n" | "no" => false,
            "" => default_yes,
            _ => default_yes,
        }
    }

    fn read_line(&mut self, question: &str) -> String {
        read_stdin_line(&format!("{question}: "))
            .trim()
            .to_string()
    }
}

fn read_stdin_line(prompt: &str) -> String {
    print!("{prompt}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return String::new();
    }
    line
}

/// Scripted implementation replaying canned answers; used by tests and
/// non-interactive invocations. Exhausted answers fall back to the default.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedPrompt {
            answers: answers.into_iter().map(Into::into).collect(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&mut self, _question: &str, default_yes: bool) -> bool {
        match self.answers.pop_front() {
            Some(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            None => default_yes,
        }
    }

    fn read_line(&mut self, _question: &str) -> String {
        self.answers.pop_front().unwrap_or_default()
    }
}
