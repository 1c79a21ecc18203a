//! Built-in transport providers.

pub mod cm108gpio;
#[cfg(not(windows))]
mod fd;
#[cfg(not(windows))]
mod listener;
#[cfg(not(windows))]
mod serialdev;
#[cfg(not(windows))]
mod stdio;
#[cfg(not(windows))]
mod tcp;
#[cfg(not(windows))]
mod unix;

use crate::{
    error::{Error, Result},
    registry::Registry,
};

/// Lifecycle shared by the built-in stream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Closed,
    InOpen,
    Open,
    /// A close was requested before the open finished.
    InOpenClose,
    InClose,
}

pub(crate) fn register_builtins(registry: &mut Registry) {
    let results = [
        registry.register_stream("cm108gpio", cm108gpio::factory),
        #[cfg(not(windows))]
        registry.register_stream("tcp", tcp::factory),
        #[cfg(not(windows))]
        registry.register_stream("unix", unix::factory),
        #[cfg(not(windows))]
        registry.register_stream("stdio", stdio::factory),
        #[cfg(not(windows))]
        registry.register_stream("serialdev", serialdev::factory),
        #[cfg(not(windows))]
        registry.register_accepter("tcp", listener::tcp_factory),
        #[cfg(not(windows))]
        registry.register_accepter("unix", listener::unix_factory),
    ];
    for result in results {
        if let Err(e) = result {
            tracing::error!(error = %e, "registering a built-in provider failed");
        }
    }
}

/// Parses the index a `Raddr` get carries in its data, the way `strtoul`
/// would: leading digits, anything else reads as 0.
pub(crate) fn raddr_index(data: &str) -> u64 {
    let digits = data.trim_start();
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().unwrap_or(0)
}

/// Answers a `Raddr` get for a transport with a single address.
pub(crate) fn single_raddr(data: &mut String, addr: impl FnOnce() -> String) -> Result<()> {
    if raddr_index(data) > 0 {
        return Err(Error::NotFound);
    }
    *data = addr();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raddr_index_like_strtoul() {
        assert_eq!(raddr_index("0"), 0);
        assert_eq!(raddr_index("2"), 2);
        assert_eq!(raddr_index(" 12abc"), 12);
        assert_eq!(raddr_index(""), 0);
        assert_eq!(raddr_index("x"), 0);
    }
}
