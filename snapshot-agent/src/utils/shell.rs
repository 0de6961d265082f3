//! Command-line quoting for commands run through `sh -c` or over SSH.

use crate::utils::errors::{AgentError, Result};
use std::borrow::Cow;

/// Quote a single argument for a POSIX shell.
pub fn quote(arg: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(arg).map_err(|e| AgentError::Config(format!("cannot quote {:?}: {}", arg, e)))
}

/// Join an argv into a single shell command line.
pub fn join<S: AsRef<str>>(argv: &[S]) -> Result<String> {
    shlex::try_join(argv.iter().map(|a| a.as_ref()))
        .map_err(|e| AgentError::Config(format!("cannot quote command line: {}", e)))
}
