//! Map loader error text onto [`LoadOutcome`] variants.

use regex::Regex;
use tsuku_schema::dltest::LoadOutcome;

/// Compiled patterns for glibc, musl and dyld messages.
#[derive(Debug)]
pub(crate) struct Classifier {
    symbol: Regex,
    permission: Regex,
}

impl Classifier {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // glibc: "undefined symbol: foo"
            // musl:  "Error relocating /x/libfoo.so: foo: symbol not found"
            // dyld:  "Symbol not found: _foo"
            symbol: Regex::new(
                r"(?:undefined symbol: (?P<a>\S+)|Symbol not found: (?P<b>\S+)|: (?P<c>[^\s:]+): symbol not found)",
            )?,
            permission: Regex::new(r"(?i)permission denied|operation not permitted")?,
        })
    }

    pub(crate) fn classify(&self, message: &str) -> LoadOutcome {
        if let Some(caps) = self.symbol.captures(message) {
            let symbol = ["a", "b", "c"]
                .iter()
                .find_map(|g| caps.name(g))
                .map(|m| m.as_str().trim_end_matches(',').to_string());
            if let Some(symbol) = symbol {
                return LoadOutcome::SymbolNotFound { symbol };
            }
        }
        if self.permission.is_match(message) {
            return LoadOutcome::PermissionDenied {
                detail: message.to_string(),
            };
        }
        LoadOutcome::Failed {
            detail: message.to_string(),
        }
    }
}
