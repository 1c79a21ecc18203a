//! `tcp,host,port`: a connecting TCP stream.

use crate::{
    error::{Error, Result},
    providers::fd::{Endpoint, FdStream},
    registry::NewStream,
    transport::Transport,
};
use std::{net::TcpStream, sync::Arc};

pub(crate) fn factory(new: NewStream<'_>) -> Result<Arc<dyn Transport>> {
    new.spec.reject_unknown(&[])?;
    let (host, port) = match new.spec.rest_fields()[..] {
        [host, port] => (host.to_owned(), parse_port(port)?),
        _ => {
            return Err(Error::invalid(format!(
                "tcp: expected host,port, got {:?}",
                new.spec.rest()
            )))
        }
    };
    let raddr = format!("tcp,{host},{port}");
    let connector = Box::new(move || {
        tracing::debug!(%host, port, "tcp connecting");
        Endpoint::tcp(TcpStream::connect((host.as_str(), port))?)
    });
    Ok(Arc::new(FdStream::new(new.ctx, "tcp", raddr, connector, new.sink)))
}

pub(crate) fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse()
        .map_err(|_| Error::invalid(format!("bad port {port:?}")))
}
