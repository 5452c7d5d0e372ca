//! Styled status output for the terminal.
//!
//! Styling is dropped when stdout is not a terminal or `NO_COLOR` is set, so
//! redirected output stays plain.

use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::sync::LazyLock;

static ENABLED: LazyLock<bool> =
    LazyLock::new(|| std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal());

/// What a piece of status text means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Heading,
    Path,
    Success,
    Warning,
    Failure,
    Muted,
}

impl Tone {
    fn sgr(self) -> &'static str {
        match self {
            Tone::Heading => "1",
            Tone::Path => "36",
            Tone::Success => "32",
            Tone::Warning => "33",
            Tone::Failure => "31",
            Tone::Muted => "2",
        }
    }
}

/// Wrap `text` in the escape sequence for `tone`.
pub fn paint(tone: Tone, text: impl Display) -> String {
    if *ENABLED {
        styled(tone, text)
    } else {
        text.to_string()
    }
}

fn styled(tone: Tone, text: impl Display) -> String {
    format!("\x1b[{}m{}\x1b[0m", tone.sgr(), text)
}

/// Flush stdout so progress printed without a newline shows up.
pub fn flush_stdout() {
    io::stdout().flush().ok();
}
