//! Shell-safe quoting for command words.

use std::borrow::Cow;

/// Quote a command word so a default POSIX shell parses it back to the
/// original string. Plain words pass through unchanged.
pub fn shell_quote(word: &str) -> Cow<'_, str> {
    shlex::try_quote(word).unwrap_or(Cow::Borrowed(word))
}
