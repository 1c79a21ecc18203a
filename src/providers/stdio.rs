//! `stdio,program args...`: a child process, talking over its stdin and
//! stdout. Its stderr is available once as a read-only channel.
//!
//! `stdio(self)` instead talks over this process' own stdin and stdout.

use crate::{
    error::{Error, Result},
    providers::fd::{Connector, Endpoint, FdStream},
    registry::NewStream,
    transport::Transport,
};
use std::{
    process::{Command, Stdio},
    sync::Arc,
};

pub(crate) fn factory(new: NewStream<'_>) -> Result<Arc<dyn Transport>> {
    new.spec.reject_unknown(&["self"])?;
    let (raddr, connector) = if new.spec.has_flag("self") {
        if !new.spec.rest().is_empty() {
            return Err(Error::invalid("stdio(self) takes no program"));
        }
        (
            "stdio(self)".to_owned(),
            Box::new(Endpoint::own_stdio) as Connector,
        )
    } else {
        let argv = split_args(new.spec.rest())?;
        let raddr = format!("stdio,{}", new.spec.rest());
        (raddr, Box::new(move || spawn(&argv)) as Connector)
    };
    Ok(Arc::new(FdStream::new(new.ctx, "stdio", raddr, connector, new.sink)))
}

fn spawn(argv: &[String]) -> std::io::Result<Endpoint> {
    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    tracing::debug!(program = %argv[0], pid = child.id(), "stdio child spawned");
    Endpoint::child(child)
}

/// Splits a command line on whitespace, honoring single and double quotes
/// and backslash escapes.
fn split_args(line: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut arg = String::new();
    let mut in_arg = false;
    let mut quote = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => arg.push(c),
            (_, '\\') => match chars.next() {
                Some(escaped) => {
                    arg.push(escaped);
                    in_arg = true;
                }
                None => return Err(Error::invalid("stdio: trailing backslash")),
            },
            (Some(_), c) => arg.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    argv.push(std::mem::take(&mut arg));
                    in_arg = false;
                }
            }
            (None, c) => {
                arg.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::invalid("stdio: unterminated quote"));
    }
    if in_arg {
        argv.push(arg);
    }
    if argv.is_empty() {
        return Err(Error::invalid("stdio: a program is required"));
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(split_args("cat").unwrap(), ["cat"]);
        assert_eq!(
            split_args(r#"sh -c 'echo "hi there"' x\ y"#).unwrap(),
            ["sh", "-c", r#"echo "hi there""#, "x y"]
        );
        assert_eq!(split_args(r#"a "" b"#).unwrap(), ["a", "", "b"]);
        assert!(split_args("").is_err());
        assert!(split_args("'open").is_err());
    }
}
