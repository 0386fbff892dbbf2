//! Colors and markers for verification output

use crossterm::style::{Color, Stylize};
use std::io::IsTerminal;
use tsuku_core::verify::report::TierStatus;
use tsuku_core::verify::report::VerificationStatus;

/// Colors and glyphs used by the renderer.
#[derive(Debug, Clone)]
pub struct Theme {
    /// Emit ANSI styling
    pub color: bool,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    pub secondary: Color,
    pub artifact: Color,
}

impl Theme {
    /// Plain output, for pipes and tests.
    pub fn plain() -> Self {
        Self {
            color: false,
            ..Self::default()
        }
    }

    /// Styled when stdout is a terminal and `NO_COLOR` is unset.
    pub fn detect() -> Self {
        Self::for_terminal(std::io::stdout().is_terminal())
    }

    /// Same as [`Theme::detect`], for progress lines on stderr.
    pub fn detect_stderr() -> Self {
        Self::for_terminal(std::io::stderr().is_terminal())
    }

    fn for_terminal(is_terminal: bool) -> Self {
        Self {
            color: is_terminal && std::env::var_os("NO_COLOR").is_none(),
            ..Self::default()
        }
    }

    pub fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    pub fn status_color(&self, status: VerificationStatus) -> Color {
        match status {
            VerificationStatus::Passed => self.success,
            VerificationStatus::PassedWithWarnings => self.warning,
            VerificationStatus::FailedFatal => self.error,
        }
    }

    /// Short marker for a tier line.
    pub fn tier_marker(&self, status: TierStatus) -> String {
        match status {
            TierStatus::Passed => self.paint("ok", self.success),
            TierStatus::Warning => self.paint("warn", self.warning),
            TierStatus::Fatal => self.paint("FAIL", self.error),
            TierStatus::Skipped => self.paint("skip", self.secondary),
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            color: true,
            success: Color::Green,
            warning: Color::Yellow,
            error: Color::Red,
            secondary: Color::DarkGrey,
            artifact: Color::Cyan,
        }
    }
}
