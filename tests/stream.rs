use io_stackstreams::{
    Accepter, AccepterDone, AccepterEventHandler, AccepterSink, AccepterTransport, Context,
    ContextBuilder, ControlDepth, ControlOption, Error, EventHandler, EventInterface, EventSink,
    ManualOs, NewAccepter, NewStream, OsServices, Outcome, Registry, SerialEvent,
    SerialEventHandler, StreamObject, Transport,
};
use parking_lot::Mutex;
use std::{
    io::IoSlice,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    thread,
    time::Duration,
};

/// A transport whose events are driven by the test through its sink.
struct Mock {
    kind: &'static str,
    sink: EventSink,
    os: Arc<ManualOs>,
    raddr: Option<String>,
    room: AtomicUsize,
    written: Mutex<Vec<u8>>,
    read_enabled: AtomicBool,
    write_enabled: AtomicBool,
}

impl Mock {
    fn new(kind: &'static str, sink: EventSink, os: Arc<ManualOs>, raddr: Option<&str>) -> Self {
        Self {
            kind,
            sink,
            os,
            raddr: raddr.map(str::to_owned),
            room: AtomicUsize::new(usize::MAX),
            written: Mutex::new(Vec::new()),
            read_enabled: AtomicBool::new(false),
            write_enabled: AtomicBool::new(false),
        }
    }
}

impl Transport for Mock {
    fn kind(&self) -> &str {
        self.kind
    }

    fn open(&self, done: io_stackstreams::OpenDone) -> io_stackstreams::Result<()> {
        self.os.schedule(Box::new(move || done(Ok(()))));
        Ok(())
    }

    fn close(&self, done: io_stackstreams::CloseDone) -> io_stackstreams::Result<()> {
        self.os.schedule(done);
        Ok(())
    }

    fn write_sg(&self, sg: &[IoSlice<'_>]) -> io_stackstreams::Result<usize> {
        let mut written = self.written.lock();
        let mut count = 0;
        for buf in sg {
            let n = buf.len().min(self.room.load(SeqCst));
            written.extend_from_slice(&buf[..n]);
            self.room.fetch_sub(n, SeqCst);
            count += n;
        }
        Ok(count)
    }

    fn set_read_callback_enable(&self, enabled: bool) {
        self.read_enabled.store(enabled, SeqCst);
    }

    fn set_write_callback_enable(&self, enabled: bool) {
        self.write_enabled.store(enabled, SeqCst);
    }

    fn control(
        &self,
        get: bool,
        option: ControlOption,
        data: &mut String,
    ) -> io_stackstreams::Result<()> {
        match (&self.raddr, get, option) {
            (Some(raddr), true, ControlOption::Raddr) => {
                *data = raddr.clone();
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn free(&self) {
        let sink = self.sink.clone();
        self.os.schedule(Box::new(move || sink.freed()));
    }
}

/// An accepter whose connections are driven by the test through its sink.
struct MockAccepter {
    kind: &'static str,
    sink: AccepterSink,
    os: Arc<ManualOs>,
}

impl AccepterTransport for MockAccepter {
    fn kind(&self) -> &str {
        self.kind
    }

    fn startup(&self) -> io_stackstreams::Result<()> {
        Ok(())
    }

    fn shutdown(&self, done: AccepterDone) -> io_stackstreams::Result<()> {
        self.os.schedule(done);
        Ok(())
    }

    fn set_accept_callback_enable(
        &self,
        _enabled: bool,
        done: Option<AccepterDone>,
    ) -> io_stackstreams::Result<()> {
        if let Some(done) = done {
            self.os.schedule(done);
        }
        Ok(())
    }

    fn free(&self) {
        let sink = self.sink.clone();
        self.os.schedule(Box::new(move || sink.freed()));
    }
}

#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<u8>>,
    errors: Mutex<Vec<String>>,
    serial: Mutex<Vec<u32>>,
    freed: AtomicUsize,
    panic_on_read: bool,
}

impl EventHandler for Recorder {
    fn read(
        &self,
        _io: &StreamObject,
        err: Option<&Error>,
        data: &[u8],
        _aux: &[&str],
    ) -> io_stackstreams::Result<usize> {
        if self.panic_on_read {
            panic!("handler blew up");
        }
        if let Some(e) = err {
            self.errors.lock().push(e.to_string());
        }
        self.data.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn freed(&self) {
        self.freed.fetch_add(1, SeqCst);
    }
}

impl SerialEventHandler for Recorder {
    fn modemstate(&self, _io: &StreamObject, state: u32) {
        self.serial.lock().push(state);
    }
}

struct Fixture {
    os: Arc<ManualOs>,
    ctx: Context,
}

fn fixture() -> anyhow::Result<Fixture> {
    let os = ManualOs::new();
    let mut registry = Registry::new();
    let base_os = os.clone();
    registry.register_stream("mockbase", move |new: NewStream<'_>| {
        let mock = Mock::new("mockbase", new.sink, base_os.clone(), Some("mockbase,here"));
        Ok(Arc::new(mock) as Arc<dyn Transport>)
    })?;
    let filter_os = os.clone();
    registry.register_filter("tag", move |new: NewStream<'_>| {
        assert!(new.child.is_some());
        let mock = Mock::new("tag", new.sink, filter_os.clone(), None);
        Ok(Arc::new(mock) as Arc<dyn Transport>)
    })?;
    let listen_os = os.clone();
    registry.register_accepter("mocklisten", move |new: NewAccepter<'_>| {
        Ok(Arc::new(MockAccepter {
            kind: "mocklisten",
            sink: new.sink,
            os: listen_os.clone(),
        }) as Arc<dyn AccepterTransport>)
    })?;
    let acc_filter_os = os.clone();
    registry.register_accepter_filter("acctag", move |new: NewAccepter<'_>| {
        assert!(new.child.is_some());
        Ok(Arc::new(MockAccepter {
            kind: "acctag",
            sink: new.sink,
            os: acc_filter_os.clone(),
        }) as Arc<dyn AccepterTransport>)
    })?;
    let ctx = ContextBuilder::new()
        .os(os.clone())
        .registry(registry)
        .build()?;
    Ok(Fixture { os, ctx })
}

fn mock(fx: &Fixture, handler: Option<EventInterface>) -> anyhow::Result<(StreamObject, Arc<Mock>)> {
    let mut keep = None;
    let io = fx.ctx.wrap_stream(handler, |sink| {
        let mock = Arc::new(Mock::new("mock", sink, fx.os.clone(), None));
        keep = Some(mock.clone());
        Ok(mock as Arc<dyn Transport>)
    })?;
    Ok((io, keep.unwrap()))
}

fn mock_accepter(fx: &Fixture) -> anyhow::Result<(Accepter, Arc<MockAccepter>)> {
    let mut keep = None;
    let acc = fx.ctx.wrap_accepter(None, |sink| {
        let listener = Arc::new(MockAccepter {
            kind: "mocklisten",
            sink,
            os: fx.os.clone(),
        });
        keep = Some(listener.clone());
        Ok(listener as Arc<dyn AccepterTransport>)
    })?;
    Ok((acc, keep.unwrap()))
}

#[test]
fn reads_reach_the_handler() -> anyhow::Result<()> {
    let fx = fixture()?;
    let rec = Arc::new(Recorder::default());
    let (_io, mock) = mock(&fx, Some(EventInterface::Stream(rec.clone())))?;

    assert_eq!(mock.sink.read(None, b"abc", &[])?, 3);
    mock.sink.read(Some(&Error::RemoteClosed), &[], &[])?;
    assert_eq!(&*rec.data.lock(), b"abc");
    assert_eq!(rec.errors.lock().len(), 1);
    Ok(())
}

#[test]
fn panicking_handler_reports_app_error() -> anyhow::Result<()> {
    let fx = fixture()?;
    let rec = Arc::new(Recorder {
        panic_on_read: true,
        ..Recorder::default()
    });
    let (io, mock) = mock(&fx, Some(EventInterface::Stream(rec)))?;

    assert!(matches!(mock.sink.read(None, b"x", &[]), Err(Error::AppError)));
    // The stream is still usable afterwards.
    assert_eq!(io.write(b"ok")?, 2);
    Ok(())
}

#[test]
fn serial_events_need_a_serial_handler() -> anyhow::Result<()> {
    let fx = fixture()?;
    let plain = Arc::new(Recorder::default());
    let (io, mock) = mock(&fx, Some(EventInterface::Stream(plain.clone())))?;
    assert!(matches!(
        mock.sink.serial(SerialEvent::Modemstate(5)),
        Err(Error::NotSupported)
    ));

    let serial = Arc::new(Recorder::default());
    io.set_event_interface(Some(EventInterface::Serial {
        base: serial.clone(),
        serial: serial.clone(),
    }));
    mock.sink.serial(SerialEvent::Modemstate(5))?;
    assert_eq!(&*serial.serial.lock(), &[5]);
    assert!(plain.serial.lock().is_empty());
    Ok(())
}

#[test]
fn unhandled_write_ready_disables_write_callbacks() -> anyhow::Result<()> {
    struct Silent;
    impl EventHandler for Silent {}

    let fx = fixture()?;
    for handler in [None, Some(EventInterface::stream(Silent))] {
        let (io, mock) = mock(&fx, handler)?;
        io.set_write_callback_enable(true);
        assert!(mock.write_enabled.load(SeqCst));
        mock.sink.write_ready()?;
        assert!(!mock.write_enabled.load(SeqCst));
    }
    Ok(())
}

#[test]
fn unclaimed_channels_are_freed() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (_io, mock) = mock(&fx, None)?;
    assert_eq!(fx.ctx.live_streams(), 1);

    let os = fx.os.clone();
    mock.sink.new_channel(&["peer"], |sink| {
        Ok(Arc::new(Mock::new("chan", sink, os, None)) as Arc<dyn Transport>)
    })?;
    fx.os.run_until_idle();
    assert_eq!(fx.ctx.live_streams(), 1);
    Ok(())
}

#[test]
fn control_walks_the_stack() -> anyhow::Result<()> {
    let fx = fixture()?;
    let io = fx.ctx.alloc_stream("tag,mockbase", None)?;
    assert_eq!(io.depth(), 2);
    assert_eq!(io.kind(), "tag");
    assert_eq!(io.get_child(1).map(|c| c.kind().to_owned()), Some("mockbase".to_owned()));
    assert!(io.get_child(2).is_none());

    assert_eq!(io.raddr()?, "mockbase,here");
    let mut data = String::from("0");
    assert!(matches!(
        io.control(ControlDepth::At(0), true, ControlOption::Raddr, &mut data),
        Err(Error::NotSupported)
    ));
    io.control(ControlDepth::At(1), true, ControlOption::Raddr, &mut data)?;
    assert_eq!(data, "mockbase,here");
    assert!(matches!(
        io.control(ControlDepth::At(2), true, ControlOption::Raddr, &mut data),
        Err(Error::NotFound)
    ));
    assert!(matches!(
        io.control(ControlDepth::All, true, ControlOption::Raddr, &mut data),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        io.control(ControlDepth::All, false, ControlOption::Other(7), &mut data),
        Err(Error::NotSupported)
    ));
    Ok(())
}

#[test]
fn bad_transport_strings() -> anyhow::Result<()> {
    let fx = fixture()?;
    assert!(matches!(fx.ctx.alloc_stream("nosuch,thing", None), Err(Error::Invalid(_))));
    assert!(matches!(fx.ctx.alloc_stream("tag", None), Err(Error::Invalid(_))));
    assert!(matches!(fx.ctx.alloc_stream("(x)", None), Err(Error::Invalid(_))));

    let mut registry = Registry::new();
    registry.register_stream("dup", |_: NewStream<'_>| Err(Error::NotSupported))?;
    assert!(matches!(
        registry.register_stream("dup", |_: NewStream<'_>| Err(Error::NotSupported)),
        Err(Error::Invalid(_))
    ));
    Ok(())
}

#[test]
fn failed_filter_frees_its_child() -> anyhow::Result<()> {
    let fx = fixture()?;
    let mut registry = Registry::new();
    let os = fx.os.clone();
    registry.register_stream("mockbase", move |new: NewStream<'_>| {
        Ok(Arc::new(Mock::new("mockbase", new.sink, os.clone(), None)) as Arc<dyn Transport>)
    })?;
    registry.register_filter("broken", |_: NewStream<'_>| Err(Error::NotSupported))?;
    let ctx = ContextBuilder::new()
        .os(fx.os.clone())
        .registry(registry)
        .build()?;

    assert!(matches!(
        ctx.alloc_stream("broken,mockbase", None),
        Err(Error::NotSupported)
    ));
    fx.os.run_until_idle();
    assert_eq!(ctx.live_streams(), 0);
    Ok(())
}

#[test]
fn sync_io_needs_sync_mode() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (io, mock) = mock(&fx, None)?;
    let mut buf = [0; 8];

    assert!(matches!(io.read_sync(&mut buf, Some(Duration::ZERO)), Err(Error::NotReady)));
    assert!(matches!(io.write_sync(b"x", Some(Duration::ZERO)), Err(Error::NotReady)));

    io.set_sync()?;
    assert_eq!(io.read_sync(&mut buf, Some(Duration::ZERO))?, Outcome::TimedOut);
    assert!(!mock.read_enabled.load(SeqCst));
    assert_eq!(io.write_sync(b"hello", Some(Duration::ZERO))?, Outcome::Ready(5));

    // Partial progress on timeout is still a ready result.
    mock.room.store(3, SeqCst);
    assert_eq!(io.write_sync(b"world", Some(Duration::ZERO))?, Outcome::Ready(3));
    assert_eq!(io.write_sync(b"!", Some(Duration::ZERO))?, Outcome::TimedOut);
    assert_eq!(&*mock.written.lock(), b"hellowor");
    Ok(())
}

#[test]
fn read_sync_takes_delivered_data() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (io, mock) = mock(&fx, None)?;
    io.set_sync()?;

    let reader = {
        let io = io.clone();
        thread::spawn(move || {
            let mut buf = [0; 4];
            let outcome = io.read_sync(&mut buf, Some(Duration::from_secs(10)));
            outcome.map(|o| o.map(|n| buf[..n].to_vec()))
        })
    };
    while !mock.read_enabled.load(SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    // Only what fits in the caller's buffer is consumed.
    assert_eq!(mock.sink.read(None, b"hello", &[])?, 4);
    let got = reader.join().unwrap()?;
    assert_eq!(got, Outcome::Ready(b"hell".to_vec()));

    // Nobody is waiting now, so delivery is refused and reads turn off.
    mock.read_enabled.store(true, SeqCst);
    assert!(mock.sink.read(None, b"o", &[]).is_err());
    assert!(!mock.read_enabled.load(SeqCst));
    Ok(())
}

#[test]
fn free_runs_freed_once() -> anyhow::Result<()> {
    let fx = fixture()?;
    let rec = Arc::new(Recorder::default());
    let (io, mock) = mock(&fx, Some(EventInterface::Stream(rec.clone())))?;
    let id = io.id();
    assert_eq!(fx.ctx.lookup_stream(id), Some(io.clone()));

    io.free()?;
    assert!(matches!(io.free(), Err(Error::NotReady)));
    assert!(matches!(io.write(b"late"), Err(Error::NotReady)));
    assert_eq!(rec.freed.load(SeqCst), 0);

    fx.os.run_until_idle();
    assert_eq!(rec.freed.load(SeqCst), 1);
    assert!(fx.ctx.lookup_stream(id).is_none());
    assert_eq!(fx.ctx.live_streams(), 0);

    // Events after the wrapper is gone go nowhere.
    assert!(matches!(mock.sink.read(None, b"x", &[]), Err(Error::NotReady)));
    assert!(rec.data.lock().is_empty());
    Ok(())
}

#[test]
fn completions_run_from_the_scheduler() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (io, _mock) = mock(&fx, None)?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    io.open(move |_, result| l.lock().push(format!("open {}", result.is_ok())))?;
    let l = log.clone();
    io.close(move |_| l.lock().push("close".to_owned()))?;
    assert!(log.lock().is_empty());

    fx.os.run_until_idle();
    assert_eq!(*log.lock(), ["open true", "close"]);
    Ok(())
}

#[test]
fn freeing_a_stack_frees_the_layer_it_created() -> anyhow::Result<()> {
    let fx = fixture()?;
    let io = fx.ctx.alloc_stream("tag,mockbase", None)?;
    assert_eq!(fx.ctx.live_streams(), 2);
    io.free()?;
    fx.os.run_until_idle();
    assert_eq!(fx.ctx.live_streams(), 0);

    // A child handed in by the caller stays the caller's to free.
    let base = fx.ctx.alloc_stream("mockbase", None)?;
    let top = fx.ctx.alloc_stream_on(&base, "tag", None)?;
    assert_eq!(top.depth(), 2);
    top.free()?;
    fx.os.run_until_idle();
    assert_eq!(fx.ctx.live_streams(), 1);
    base.free()?;
    fx.os.run_until_idle();
    assert_eq!(fx.ctx.live_streams(), 0);
    Ok(())
}

#[test]
fn freeing_an_accepter_stack_frees_the_layer_it_created() -> anyhow::Result<()> {
    let fx = fixture()?;
    assert!(matches!(fx.ctx.alloc_accepter("acctag", None), Err(Error::Invalid(_))));

    let acc = fx.ctx.alloc_accepter("acctag,mocklisten", None)?;
    assert_eq!(fx.ctx.live_accepters(), 2);
    assert_eq!(
        acc.get_child(1).map(|c| c.kind().to_owned()),
        Some("mocklisten".to_owned())
    );
    acc.free()?;
    fx.os.run_until_idle();
    assert_eq!(fx.ctx.live_accepters(), 0);
    Ok(())
}

#[test]
fn interrupted_sync_io_can_be_retried() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (io, mock) = mock(&fx, None)?;
    io.set_sync()?;
    assert!(!io.interrupt_sync());

    let reader = {
        let io = io.clone();
        thread::spawn(move || {
            let mut buf = [0; 4];
            io.read_sync_intr(&mut buf, Some(Duration::from_secs(10)))
        })
    };
    while !io.interrupt_sync() {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(reader.join().unwrap()?, Outcome::Interrupted);
    assert!(!mock.read_enabled.load(SeqCst));

    let reader = {
        let io = io.clone();
        thread::spawn(move || {
            let mut buf = [0; 4];
            let outcome = io.read_sync_intr(&mut buf, Some(Duration::from_secs(10)));
            outcome.map(|o| o.map(|n| buf[..n].to_vec()))
        })
    };
    while !mock.read_enabled.load(SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(mock.sink.read(None, b"ok", &[])?, 2);
    assert_eq!(reader.join().unwrap()?, Outcome::Ready(b"ok".to_vec()));

    // No room at all, so the writer blocks until interrupted.
    mock.room.store(0, SeqCst);
    let writer = {
        let io = io.clone();
        thread::spawn(move || io.write_sync_intr(b"x", Some(Duration::from_secs(10))))
    };
    while !io.interrupt_sync() {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(writer.join().unwrap()?, Outcome::Interrupted);
    mock.room.store(8, SeqCst);
    assert_eq!(io.write_sync_intr(b"x", Some(Duration::ZERO))?, Outcome::Ready(1));
    Ok(())
}

#[test]
fn interrupted_accept_can_be_retried() -> anyhow::Result<()> {
    let fx = fixture()?;
    let (acc, listener) = mock_accepter(&fx)?;
    acc.set_sync()?;
    assert!(!acc.interrupt_sync());

    let waiting = {
        let acc = acc.clone();
        thread::spawn(move || acc.accept_sync_intr(Some(Duration::from_secs(10))))
    };
    while !acc.interrupt_sync() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(waiting.join().unwrap()?, Outcome::Interrupted));

    let os = fx.os.clone();
    listener.sink.new_connection(|sink| {
        Ok(Arc::new(Mock::new("conn", sink, os, None)) as Arc<dyn Transport>)
    })?;
    match acc.accept_sync_intr(Some(Duration::from_secs(10)))? {
        Outcome::Ready(io) => assert_eq!(io.kind(), "conn"),
        other => anyhow::bail!("no connection: {other:?}"),
    }
    Ok(())
}

#[test]
fn accepter_auth_checkpoints_reach_the_handler() -> anyhow::Result<()> {
    #[derive(Default)]
    struct Gate {
        begun: AtomicUsize,
    }

    impl AccepterEventHandler for Gate {
        fn auth_begin(&self, _acc: &Accepter, _io: &StreamObject) -> io_stackstreams::Result<()> {
            self.begun.fetch_add(1, SeqCst);
            Ok(())
        }

        fn precert_verify(
            &self,
            _acc: &Accepter,
            _io: &StreamObject,
        ) -> io_stackstreams::Result<()> {
            panic!("certificate check blew up");
        }

        fn password_verify(
            &self,
            _acc: &Accepter,
            _io: &StreamObject,
            password: &str,
        ) -> io_stackstreams::Result<()> {
            if password == "secret" {
                Ok(())
            } else {
                Err(Error::Invalid("wrong password".to_owned()))
            }
        }
    }

    let fx = fixture()?;
    let (acc, listener) = mock_accepter(&fx)?;
    let (io, _mock) = mock(&fx, None)?;
    assert!(matches!(listener.sink.auth_begin(&io), Err(Error::NotSupported)));

    let gate = Arc::new(Gate::default());
    acc.set_event_handler(Some(gate.clone() as Arc<dyn AccepterEventHandler>));
    listener.sink.auth_begin(&io)?;
    assert_eq!(gate.begun.load(SeqCst), 1);
    listener.sink.password_verify(&io, "secret")?;
    assert!(matches!(
        listener.sink.password_verify(&io, "guess"),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(listener.sink.precert_verify(&io), Err(Error::AppError)));
    assert!(matches!(listener.sink.request_password(&io), Err(Error::NotSupported)));

    // The handler survives its own panic.
    listener.sink.auth_begin(&io)?;
    assert_eq!(gate.begun.load(SeqCst), 2);
    Ok(())
}
