#![cfg(not(windows))]

use cap_std::ambient_authority;
use cap_tempfile::TempDir;
use io_stackstreams::{
    providers::cm108gpio::Cm108Gpio, Context, ContextBuilder, ControlDepth, ControlOption, Error,
    ManualOs,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

const USB_DEV: &str = "devices/pci0000:00/0000:00:14.0/usb1/1-1";

/// A sysfs tree holding one USB sound card, id "Device", whose HID node is
/// hidraw1, plus the matching device root.
fn fake_tree() -> anyhow::Result<(TempDir, TempDir)> {
    let sys = TempDir::new(ambient_authority())?;
    sys.write(format!("{USB_DEV}/idVendor"), "0d8c\n")?;
    let card = format!("{USB_DEV}/1-1:1.0/sound/card1");
    sys.create_dir_all(&card)?;
    sys.write(format!("{card}/id"), "Device\n")?;
    sys.write(format!("{card}/number"), "1\n")?;
    let hid = format!("{USB_DEV}/1-1:1.3/0003:0D8C:0012.0002/hidraw/hidraw1");
    sys.create_dir_all(&hid)?;
    sys.create_dir_all("class/sound")?;
    sys.symlink(format!("../../{card}"), "class/sound/card1")?;
    sys.create_dir_all("class/hidraw")?;
    sys.symlink(format!("../../{hid}"), "class/hidraw/hidraw1")?;

    let dev = TempDir::new(ambient_authority())?;
    dev.write("hidraw1", "")?;
    Ok((sys, dev))
}

fn context(sys: &TempDir, dev: &TempDir) -> anyhow::Result<(Arc<ManualOs>, Context)> {
    let os = ManualOs::new();
    let ctx = ContextBuilder::new()
        .os(os.clone())
        .sysfs_dir(sys.try_clone()?)
        .dev_dir(dev.try_clone()?)
        .build()?;
    Ok((os, ctx))
}

#[test]
fn writes_hid_reports() -> anyhow::Result<()> {
    let (sys, dev) = fake_tree()?;
    let (os, ctx) = context(&sys, &dev)?;
    let io = ctx.alloc_stream("cm108gpio(bit=2),Device", None)?;
    assert_eq!(io.raddr()?, "cm108gpio,Device,2");
    assert!(matches!(io.write(b"1"), Err(Error::NotReady)));

    io.open(|_, _| {})?;
    os.run_until_idle();
    // The last 0 or 1 in a write wins; other bytes are ignored.
    assert_eq!(io.write(b"x1y")?, 3);
    assert_eq!(io.write(b"10")?, 2);
    assert_eq!(io.write(b"zz")?, 2);
    assert_eq!(dev.read("hidraw1")?, [0, 0, 2, 2, 0, 0, 0, 0, 2, 0]);

    io.close(|_| {})?;
    os.run_until_idle();
    io.free()?;
    os.run_until_idle();
    assert_eq!(ctx.live_streams(), 0);
    Ok(())
}

#[test]
fn open_describe_close() -> anyhow::Result<()> {
    let (sys, dev) = fake_tree()?;
    let (os, ctx) = context(&sys, &dev)?;
    let io = ctx.alloc_stream("cm108gpio(bit=3),1", None)?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    io.open(move |_, r| l.lock().push(format!("open {}", r.is_ok())))?;
    assert!(log.lock().is_empty());
    os.run_until_idle();

    let mut data = String::from("0");
    io.control(ControlDepth::At(0), true, ControlOption::Raddr, &mut data)?;
    assert_eq!(data, "cm108gpio,1,3");

    let l = log.clone();
    io.close(move |_| l.lock().push("close".to_owned()))?;
    os.run_until_idle();
    assert_eq!(*log.lock(), ["open true", "close"]);
    assert!(matches!(io.close(|_| {}), Err(Error::NotReady)));

    io.free()?;
    os.run_until_idle();
    assert_eq!(ctx.live_streams(), 0);
    Ok(())
}

#[test]
fn bad_arguments() -> anyhow::Result<()> {
    let (sys, dev) = fake_tree()?;
    let (_os, ctx) = context(&sys, &dev)?;
    assert!(matches!(ctx.alloc_stream("cm108gpio(bit=9),1", None), Err(Error::Invalid(_))));
    assert!(matches!(ctx.alloc_stream("cm108gpio(bit=0),1", None), Err(Error::Invalid(_))));
    assert!(matches!(ctx.alloc_stream("cm108gpio(pin=1),1", None), Err(Error::Invalid(_))));
    assert!(matches!(ctx.alloc_stream("cm108gpio", None), Err(Error::Invalid(_))));
    assert!(matches!(ctx.alloc_stream("cm108gpio,NoSuch", None), Err(Error::Io(_))));
    assert!(matches!(Cm108Gpio::alloc(&ctx, "1", 0, None), Err(Error::Invalid(_))));
    assert_eq!(ctx.live_streams(), 0);

    let io = Cm108Gpio::alloc(&ctx, "1", 8, None)?;
    let mut data = String::from("1");
    assert!(matches!(
        io.control(ControlDepth::At(0), true, ControlOption::Raddr, &mut data),
        Err(Error::NotFound)
    ));
    io.free()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Open,
    Close,
    Run,
    Write(bool),
    WriteReady(bool),
}

/// What the stream should be doing, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Closed,
    Opening,
    Open,
    OpeningClosing,
    Closing,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Open),
        Just(Op::Close),
        Just(Op::Run),
        any::<bool>().prop_map(Op::Write),
        any::<bool>().prop_map(Op::WriteReady),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn open_close_sequences(ops in proptest::collection::vec(op(), 0..40)) {
        let (sys, dev) = fake_tree().unwrap();
        let (os, ctx) = context(&sys, &dev).unwrap();
        let io = ctx.alloc_stream("cm108gpio,Device", None).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut model = Model::Closed;

        for op in ops {
            match op {
                Op::Open => {
                    let l = log.clone();
                    let result = io.open(move |_, r| l.lock().push(r.is_ok()));
                    prop_assert_eq!(result.is_ok(), model == Model::Closed);
                    if model == Model::Closed {
                        model = Model::Opening;
                    }
                }
                Op::Close => {
                    let result = io.close(|_| {});
                    let next = match model {
                        Model::Open => Some(Model::Closing),
                        Model::Opening => Some(Model::OpeningClosing),
                        _ => None,
                    };
                    prop_assert_eq!(result.is_ok(), next.is_some());
                    model = next.unwrap_or(model);
                }
                Op::Run => {
                    let opens = log.lock().len();
                    os.run_until_idle();
                    let expect = match model {
                        Model::Opening => Some(true),
                        Model::OpeningClosing => Some(false),
                        _ => None,
                    };
                    let log = log.lock();
                    match expect {
                        Some(ok) => prop_assert_eq!(log.get(opens).copied(), Some(ok)),
                        None => prop_assert_eq!(log.len(), opens),
                    }
                    model = match model {
                        Model::Opening | Model::Open => Model::Open,
                        _ => Model::Closed,
                    };
                }
                Op::Write(on) => {
                    let result = io.write(if on { b"1" } else { b"0" });
                    prop_assert_eq!(result.is_ok(), model == Model::Open);
                }
                Op::WriteReady(enabled) => io.set_write_callback_enable(enabled),
            }
            // One deferred token at most, however the calls interleave.
            prop_assert!(os.pending() <= 1);
        }

        io.free().unwrap();
        os.run_until_idle();
        prop_assert_eq!(os.pending(), 0);
        prop_assert_eq!(ctx.live_streams(), 0);
    }
}
