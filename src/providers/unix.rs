//! `unix,path`: a connecting Unix-domain stream socket.

use crate::{
    error::{Error, Result},
    providers::fd::{Endpoint, FdStream},
    registry::NewStream,
    transport::Transport,
};
use std::{os::unix::net::UnixStream, path::PathBuf, sync::Arc};

pub(crate) fn factory(new: NewStream<'_>) -> Result<Arc<dyn Transport>> {
    new.spec.reject_unknown(&[])?;
    let path = new.spec.rest();
    if path.is_empty() {
        return Err(Error::invalid("unix: a socket path is required"));
    }
    let raddr = format!("unix,{path}");
    let path = PathBuf::from(path);
    let connector = Box::new(move || Endpoint::unix(UnixStream::connect(&path)?));
    Ok(Arc::new(FdStream::new(new.ctx, "unix", raddr, connector, new.sink)))
}
