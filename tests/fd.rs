#![cfg(not(windows))]

use io_stackstreams::{
    serial::PARITY_NONE,
    Context, ContextBuilder, ControlDepth, ControlOption, Error, Outcome, StreamObject, Waiter,
};
use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use std::{
    process, thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Reads until `n` bytes have arrived.
fn read_n(io: &StreamObject, n: usize) -> anyhow::Result<Vec<u8>> {
    let mut got = Vec::new();
    let mut buf = [0; 64];
    while got.len() < n {
        match io.read_sync(&mut buf, TIMEOUT)? {
            Outcome::Ready(len) => got.extend_from_slice(&buf[..len]),
            other => anyhow::bail!("read stopped early: {other:?}"),
        }
    }
    Ok(got)
}

fn write_all(io: &StreamObject, data: &[u8]) -> anyhow::Result<()> {
    assert_eq!(io.write_sync(data, TIMEOUT)?, Outcome::Ready(data.len()));
    Ok(())
}

#[test]
fn tcp_loopback() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let acc = ctx.alloc_accepter("tcp,127.0.0.1,0", None)?;
    acc.set_sync()?;
    acc.startup()?;
    assert!(matches!(acc.startup(), Err(Error::NotReady)));
    let port = acc.get_port()?;
    assert_ne!(port, "0");

    let client = ctx.alloc_stream(&format!("tcp,127.0.0.1,{port}"), None)?;
    client.open_sync()?;
    let server = match acc.accept_sync(TIMEOUT)? {
        Outcome::Ready(io) => io,
        other => anyhow::bail!("no connection: {other:?}"),
    };
    assert_eq!(server.kind(), "tcp");
    assert_eq!(client.raddr()?, format!("tcp,127.0.0.1,{port}"));

    let mut lport = String::new();
    client.control(ControlDepth::First, true, ControlOption::Lport, &mut lport)?;
    assert!(server.raddr()?.ends_with(&format!(",{lport}")));

    client.set_sync()?;
    server.set_sync()?;
    write_all(&client, b"ping")?;
    assert_eq!(read_n(&server, 4)?, b"ping");
    write_all(&server, b"pong!")?;
    assert_eq!(read_n(&client, 5)?, b"pong!");

    client.close_sync()?;
    let mut buf = [0; 8];
    assert!(matches!(
        server.read_sync(&mut buf, TIMEOUT),
        Err(Error::RemoteClosed)
    ));

    // A closed connecting stream can be opened again.
    client.open_sync()?;
    match acc.accept_sync(TIMEOUT)? {
        Outcome::Ready(io) => io.free()?,
        other => anyhow::bail!("no second connection: {other:?}"),
    }

    client.free()?;
    server.free()?;
    acc.shutdown_sync()?;
    acc.free()?;
    Ok(())
}

#[test]
fn accept_sync_times_out() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let acc = ctx.alloc_accepter("tcp,127.0.0.1,0", None)?;
    assert!(matches!(acc.accept_sync(Some(Duration::ZERO)), Err(Error::NotReady)));
    acc.set_sync()?;
    acc.startup()?;
    assert!(matches!(
        acc.accept_sync(Some(Duration::from_millis(20)))?,
        Outcome::TimedOut
    ));
    acc.shutdown_sync()?;
    assert!(matches!(acc.shutdown_sync(), Err(Error::NotReady)));
    acc.free()?;
    Ok(())
}

#[test]
fn refused_connection_fails_open() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let acc = ctx.alloc_accepter("tcp,127.0.0.1,0", None)?;
    acc.startup()?;
    let port = acc.get_port()?;
    acc.shutdown_sync()?;
    acc.free()?;

    let io = ctx.alloc_stream(&format!("tcp,127.0.0.1,{port}"), None)?;
    assert!(matches!(io.open_sync(), Err(Error::Io(_))));
    assert!(matches!(io.write(b"x"), Err(Error::NotReady)));
    io.free()?;
    Ok(())
}

#[test]
fn unix_roundtrip() -> anyhow::Result<()> {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
    let path = std::env::temp_dir().join(format!("stackstreams-{}-{nanos}.sock", process::id()));
    let spec = format!("unix,{}", path.display());

    let ctx = Context::new()?;
    let acc = ctx.alloc_accepter(&spec, None)?;
    acc.set_sync()?;
    acc.startup()?;
    assert_eq!(acc.get_port()?, "0");

    let client = ctx.alloc_stream(&spec, None)?;
    client.open_sync()?;
    let server = match acc.accept_sync(TIMEOUT)? {
        Outcome::Ready(io) => io,
        other => anyhow::bail!("no connection: {other:?}"),
    };
    client.set_sync()?;
    server.set_sync()?;
    write_all(&server, b"hello over unix")?;
    assert_eq!(read_n(&client, 15)?, b"hello over unix");

    client.free()?;
    server.free()?;
    acc.shutdown_sync()?;
    acc.free()?;
    assert!(!path.exists());
    Ok(())
}

#[test]
fn stdio_child_echoes() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let io = ctx.alloc_stream("stdio,cat", None)?;
    assert_eq!(io.raddr()?, "stdio,cat");
    io.open_sync()?;
    io.set_sync()?;
    write_all(&io, b"hello\n")?;
    assert_eq!(read_n(&io, 6)?, b"hello\n");
    io.close_sync()?;
    assert!(matches!(io.write(b"x"), Err(Error::NotReady)));
    io.free()?;
    Ok(())
}

#[test]
fn close_drops_output_a_child_never_reads() -> anyhow::Result<()> {
    let ctx = ContextBuilder::new()
        .close_timeout(Duration::from_millis(200))
        .build()?;
    let io = ctx.alloc_stream("stdio,sleep 100", None)?;
    io.open_sync()?;

    // Fill the pipe, then the write buffer behind it.
    let block = vec![b'x'; 64 * 1024];
    assert!(io.write(&block)? > 0);
    thread::sleep(Duration::from_millis(300));
    io.write(&block)?;

    let waiter = Waiter::new();
    let w = waiter.clone();
    io.close(move |_| w.wake())?;
    assert_eq!(waiter.wait(1, Some(Duration::from_secs(5))), Outcome::Ready(()));
    io.free()?;
    Ok(())
}

#[test]
fn stdio_stderr_channel() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let io = ctx.alloc_stream("stdio,sh -c 'echo oops >&2'", None)?;
    assert!(matches!(io.alloc_channel(&[], None), Err(Error::NotReady)));
    io.open_sync()?;

    let stderr = io.alloc_channel(&[], None)?;
    assert_eq!(stderr.kind(), "stderr");
    assert!(matches!(io.alloc_channel(&[], None), Err(Error::NotFound)));
    assert!(matches!(stderr.write(b"x"), Err(Error::NotSupported)));
    stderr.set_sync()?;
    assert_eq!(read_n(&stderr, 5)?, b"oops\n");

    stderr.free()?;
    io.close_sync()?;
    io.free()?;
    Ok(())
}

#[test]
fn serialdev_on_a_pty() -> anyhow::Result<()> {
    let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let name = ptsname(&master, Vec::new())?;
    let name = name.to_str()?;

    let ctx = Context::new()?;
    let io = ctx.alloc_stream(&format!("serialdev,{name},19200n82"), None)?;
    assert!(io.serial().is_some());
    let serial = io.serial().unwrap();
    // Settings are only reachable while the port is open.
    assert!(matches!(serial.baud_sync(0), Err(Error::NotReady)));

    // A pty keeps speed and stop bits; it forces 8 data bits and no parity.
    io.open_sync()?;
    assert_eq!(serial.baud_sync(0)?, 19200);
    assert_eq!(serial.datasize_sync(0)?, 8);
    assert_eq!(serial.parity_sync(0)?, PARITY_NONE);
    assert_eq!(serial.stopbits_sync(0)?, 2);
    assert_eq!(serial.baud_sync(38400)?, 38400);
    assert_eq!(serial.stopbits_sync(1)?, 1);
    assert!(matches!(serial.datasize_sync(9), Err(Error::Invalid(_))));
    assert!(matches!(serial.parity_sync(42), Err(Error::Invalid(_))));
    assert!(matches!(serial.dtr_sync(1), Err(Error::NotSupported)));

    io.set_sync()?;
    rustix::io::write(&master, b"abc")?;
    assert_eq!(read_n(&io, 3)?, b"abc");

    io.close_sync()?;
    io.free()?;
    Ok(())
}

#[test]
fn other_streams_have_no_serial_control() -> anyhow::Result<()> {
    let ctx = Context::new()?;
    let io = ctx.alloc_stream("stdio,cat", None)?;
    assert!(io.serial().is_none());
    io.free()?;
    Ok(())
}
