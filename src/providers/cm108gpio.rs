//! GPIO output on CM108-family USB sound adapters.
//!
//! These chips expose their GPIO pins through a HID output report, which
//! radio interfaces wire to push-to-talk. The stream is write-only: any `1`
//! byte in a write raises the configured pin, any `0` lowers it, and the
//! last such byte in a write wins.
//!
//! The adapter is named by its ALSA card id or number. Its HID node is found
//! through sysfs: the sound card must hang off a USB device, and the hidraw
//! node is the one under the same USB device.

use crate::{
    context::Context,
    deferred::{self, Deferred, Refs, Step},
    error::{Error, Result},
    os::OsServices,
    providers::{single_raddr, State},
    registry::NewStream,
    transport::{CloseDone, ControlOption, EventSink, OpenDone, Transport},
};
use cap_std::{ambient_authority, fs::Dir, fs::OpenOptions};
use parking_lot::{Mutex, MutexGuard};
use std::{
    fs::File,
    io::{self, IoSlice, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// The pin driven when no `bit` option is given.
pub const DEFAULT_BIT: u32 = 3;

/// A CM108 GPIO transport.
pub struct Cm108Gpio {
    shared: Arc<Shared>,
}

struct Shared {
    os: Arc<dyn OsServices>,
    sink: EventSink,
    idnum: String,
    bit: u32,
    dev: Arc<Dir>,
    devname: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    refs: Refs,
    state: State,
    fd: Option<File>,
    xmit_enabled: bool,
    open_done: Option<OpenDone>,
    close_done: Option<CloseDone>,
}

pub(crate) fn factory(new: NewStream<'_>) -> Result<Arc<dyn Transport>> {
    new.spec.reject_unknown(&["bit"])?;
    let bit = new.spec.uint_param("bit")?.unwrap_or(DEFAULT_BIT);
    Ok(Arc::new(Cm108Gpio::new(new.ctx, new.spec.rest(), bit, new.sink)?))
}

impl Cm108Gpio {
    /// Locates the HID node of the sound card `idnum` and prepares a
    /// transport driving pin `bit` (1 through 8) on it.
    pub fn new(ctx: &Context, idnum: &str, bit: u32, sink: EventSink) -> Result<Self> {
        if !(1..=8).contains(&bit) {
            return Err(Error::invalid(format!(
                "cm108gpio: bit value must be from 1-8, it was {bit}"
            )));
        }
        let config = ctx.config();
        let sysfs = match &config.sysfs {
            Some(dir) => Arc::clone(dir),
            None => Arc::new(Dir::open_ambient_dir("/sys", ambient_authority())?),
        };
        let dev = match &config.dev {
            Some(dir) => Arc::clone(dir),
            None => Arc::new(Dir::open_ambient_dir("/dev", ambient_authority())?),
        };
        let devname = find_hid_device(&sysfs, idnum)?;
        tracing::debug!(idnum, bit, device = %devname.display(), "cm108gpio device located");

        Ok(Self {
            shared: Arc::new(Shared {
                os: Arc::clone(ctx.os()),
                sink,
                idnum: idnum.to_owned(),
                bit,
                dev,
                devname,
                inner: Mutex::new(Inner {
                    refs: Refs::new(),
                    state: State::Closed,
                    fd: None,
                    xmit_enabled: false,
                    open_done: None,
                    close_done: None,
                }),
            }),
        })
    }

    /// Allocates a cm108gpio stream object directly.
    pub fn alloc(
        ctx: &Context,
        idnum: &str,
        bit: u32,
        handler: Option<crate::EventInterface>,
    ) -> Result<crate::StreamObject> {
        ctx.wrap_stream(handler, |sink| {
            Ok(Arc::new(Self::new(ctx, idnum, bit, sink)?) as Arc<dyn Transport>)
        })
    }
}

impl Shared {
    fn hid_set(&self, fd: &mut File, on: bool) -> Result<()> {
        let mask = 1u8 << (self.bit - 1);
        let report = [0, 0, if on { mask } else { 0 }, mask, 0];
        let n = fd.write(&report)?;
        if n != report.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short HID report write").into());
        }
        Ok(())
    }
}

impl Deferred for Shared {
    type State = Inner;

    fn state(&self) -> &Mutex<Inner> {
        &self.inner
    }

    fn refs(state: &mut Inner) -> &mut Refs {
        &mut state.refs
    }

    fn os(&self) -> &dyn OsServices {
        &*self.os
    }

    fn step(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        match st.state {
            State::InOpen | State::InOpenClose => {
                let result = if st.state == State::InOpenClose {
                    st.state = State::InClose;
                    Err(Error::LocalClosed)
                } else {
                    st.state = State::Open;
                    Ok(())
                };
                if let Some(done) = st.open_done.take() {
                    MutexGuard::unlocked(st, || done(result));
                }
                Step::Again
            }
            State::Open if st.xmit_enabled => {
                match MutexGuard::unlocked(st, || self.sink.write_ready()) {
                    Ok(()) => Step::Again,
                    Err(e) => {
                        tracing::debug!(error = %e, "cm108gpio write-ready delivery failed");
                        if st.state == State::Open {
                            Step::Idle
                        } else {
                            Step::Again
                        }
                    }
                }
            }
            State::InClose => {
                st.fd = None;
                st.state = State::Closed;
                if let Some(done) = st.close_done.take() {
                    MutexGuard::unlocked(st, done);
                }
                Step::Again
            }
            State::Open | State::Closed => Step::Idle,
        }
    }

    fn finish_free(&self, st: &mut Inner) {
        st.fd = None;
        st.open_done = None;
        st.close_done = None;
    }

    fn freed(&self) {
        self.sink.freed();
    }
}

impl Transport for Cm108Gpio {
    fn kind(&self) -> &str {
        "cm108gpio"
    }

    fn open(&self, done: OpenDone) -> Result<()> {
        let mut st = self.shared.inner.lock();
        if st.state != State::Closed {
            return Err(Error::NotReady);
        }
        let fd = self
            .shared
            .dev
            .open_with(&self.shared.devname, OpenOptions::new().write(true))?
            .into_std();
        st.fd = Some(fd);
        st.state = State::InOpen;
        st.open_done = Some(done);
        deferred::start(&self.shared, &mut *st);
        Ok(())
    }

    fn close(&self, done: CloseDone) -> Result<()> {
        let mut st = self.shared.inner.lock();
        st.state = match st.state {
            State::Open => State::InClose,
            State::InOpen => State::InOpenClose,
            _ => return Err(Error::NotReady),
        };
        st.close_done = Some(done);
        deferred::start(&self.shared, &mut *st);
        Ok(())
    }

    fn write_sg(&self, sg: &[IoSlice<'_>]) -> Result<usize> {
        let mut set = None;
        let mut count = 0;
        for buf in sg {
            for &b in buf.iter() {
                match b {
                    b'1' => set = Some(true),
                    b'0' => set = Some(false),
                    _ => {}
                }
            }
            count += buf.len();
        }

        let mut st = self.shared.inner.lock();
        if st.state != State::Open {
            return Err(Error::NotReady);
        }
        if let Some(on) = set {
            let fd = st.fd.as_mut().ok_or(Error::NotReady)?;
            self.shared.hid_set(fd, on)?;
        }
        Ok(count)
    }

    fn set_read_callback_enable(&self, _enabled: bool) {}

    fn set_write_callback_enable(&self, enabled: bool) {
        let mut st = self.shared.inner.lock();
        st.xmit_enabled = enabled;
        if enabled && st.state == State::Open {
            deferred::start(&self.shared, &mut *st);
        }
    }

    fn control(&self, get: bool, option: ControlOption, data: &mut String) -> Result<()> {
        if option != ControlOption::Raddr || !get {
            return Err(Error::NotSupported);
        }
        single_raddr(data, || {
            format!("cm108gpio,{},{}", self.shared.idnum, self.shared.bit)
        })
    }

    fn disable(&self) -> Result<()> {
        self.shared.inner.lock().state = State::Closed;
        Ok(())
    }

    fn free(&self) {
        let mut st = self.shared.inner.lock();
        st.state = State::Closed;
        deferred::unlock_and_deref(&*self.shared, st);
    }
}

/// Finds the hidraw node, relative to the device root, belonging to the USB
/// sound card whose ALSA `id` or `number` is `idnum`.
fn find_hid_device(sysfs: &Dir, idnum: &str) -> Result<PathBuf> {
    if idnum.is_empty() {
        return Err(Error::invalid(
            "cm108gpio: you must provide an id or number to compare",
        ));
    }

    let mut card = None;
    for name in sorted_entries(sysfs, "class/sound")? {
        let base = Path::new("class/sound").join(&name);
        let id = read_attr(sysfs, &base.join("id"));
        let number = read_attr(sysfs, &base.join("number"));
        if id.as_deref() != Some(idnum) && number.as_deref() != Some(idnum) {
            continue;
        }
        let path = sysfs.canonicalize(&base)?;
        if path
            .ancestors()
            .skip(1)
            .any(|dir| sysfs.exists(dir.join("idVendor")))
        {
            card = Some(path);
            break;
        }
    }
    let card = card.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("unable to find matching sound device {idnum:?}"),
        )
    })?;

    // The USB device's path, minus the interface suffix, prefixes every
    // node under that device.
    let card = card.to_string_lossy();
    let end = card.rfind("/sound/").ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no /sound/ in device path {card}"))
    })?;
    let base = &card[..end];
    let colon = base.rfind(':').ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no ':' in device path {base}"))
    })?;
    let prefix = &base[..colon];

    for name in sorted_entries(sysfs, "class/hidraw")? {
        let path = sysfs.canonicalize(Path::new("class/hidraw").join(&name))?;
        if path.to_string_lossy().starts_with(prefix) {
            return Ok(PathBuf::from(name));
        }
    }
    Err(Error::NotFound)
}

fn sorted_entries(dir: &Dir, path: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir.read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn read_attr(dir: &Dir, path: &Path) -> Option<String> {
    dir.read_to_string(path).ok().map(|s| s.trim().to_owned())
}
