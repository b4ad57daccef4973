//! Line-oriented wire protocol spoken over the plugin's terminal.
//!
//! A request is a header: the hook name on one line, each argument on its own
//! line, then an `END` terminator. Everything the plugin writes back is read
//! line by line; lines starting with `RETURN` carry values for the caller,
//! lines starting with `ECHO` are always shown to the operator, and anything
//! else is plugin chatter that is only shown in verbose mode.

use std::io::{self, Write};

use super::Hook;

pub(crate) const END_OF_HEADER: &str = "END";
const RETURN_PREFIX: &str = "RETURN ";
const ECHO_PREFIX: &str = "ECHO ";

/// Write one request header.
pub(crate) fn write_request<W: Write>(writer: &mut W, hook: Hook, args: &[String]) -> io::Result<()> {
    writeln!(writer, "{}", hook.as_str())?;
    for arg in args {
        writeln!(writer, "{arg}")?;
    }
    writeln!(writer, "{END_OF_HEADER}")?;
    writer.flush()
}

/// Interprets plugin output, accumulating `RETURN` values.
pub(crate) struct Interpreter {
    verbose: bool,
    returns: Vec<String>,
}

impl Interpreter {
    pub(crate) fn new(verbose: bool) -> Self {
        Self { verbose, returns: Vec::new() }
    }

    /// Handle a single line of plugin output.
    pub(crate) fn interpret<W: Write>(&mut self, line: &str, output: &mut W) -> io::Result<()> {
        if let Some(value) = strip_prefix_ignore_case(line, RETURN_PREFIX) {
            log::trace!("plugin returned [{value}]");
            self.returns.push(value.to_string());
            return Ok(());
        }
        if let Some(text) = strip_prefix_ignore_case(line, ECHO_PREFIX) {
            return writeln!(output, "{text}");
        }
        if self.verbose {
            return writeln!(output, "{line}");
        }
        Ok(())
    }

    pub(crate) fn into_returns(self) -> Vec<String> {
        self.returns
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
