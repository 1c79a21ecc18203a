//! `serialdev,path[,9600n81][,rtscts|xonxoff][,local]`: a serial port.
//!
//! The speed field is the baud rate followed by an optional parity letter
//! (`n`, `o`, `e`, `m`, `s`), data size and stop bit count. Line settings
//! are applied each time the port opens, and can be read and changed while
//! it is open through serial control.

use crate::{
    error::{Error, Result},
    event::guarded,
    providers::fd::{Endpoint, FdHandle, FdStream},
    registry::NewStream,
    serial::{
        SerialControl, SerialDone, SerialOp, FLOWCONTROL_NONE, FLOWCONTROL_RTS_CTS,
        FLOWCONTROL_XON_XOFF, PARITY_EVEN, PARITY_MARK, PARITY_NONE, PARITY_ODD, PARITY_SPACE,
    },
    transport::Transport,
};
use rustix::{
    fs::OFlags,
    termios::{tcgetattr, tcsetattr, ControlModes, InputModes, OptionalActions, Termios},
};
use std::{
    fs::{File, OpenOptions},
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
    sync::Arc,
};

pub(crate) fn factory(new: NewStream<'_>) -> Result<Arc<dyn Transport>> {
    new.spec.reject_unknown(&[])?;
    let fields = new.spec.rest_fields();
    let (path, opts) = match fields.split_first() {
        Some((path, opts)) if !path.is_empty() => (PathBuf::from(path), opts),
        _ => return Err(Error::invalid("serialdev: a device path is required")),
    };
    let settings = LineSettings::parse(opts)?;
    let raddr = format!("serialdev,{}", new.spec.rest());

    let connector = Box::new(move || {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlags::NOCTTY.bits() as i32)
            .open(&path)?;
        settings.apply(&file)?;
        tracing::debug!(device = %path.display(), ?settings, "serial port configured");
        Endpoint::device(file)
    });
    let mut stream = FdStream::new(new.ctx, "serialdev", raddr, connector, new.sink);
    let control = SerialDev {
        handle: stream.handle(),
    };
    stream.set_serial(Box::new(control));
    Ok(Arc::new(stream))
}

/// Line settings applied when the port opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineSettings {
    baud: u32,
    datasize: u32,
    parity: u32,
    stopbits: u32,
    flow: u32,
    local: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            datasize: 8,
            parity: PARITY_NONE,
            stopbits: 1,
            flow: FLOWCONTROL_NONE,
            local: false,
        }
    }
}

impl LineSettings {
    fn parse(opts: &[&str]) -> Result<Self> {
        let mut settings = Self::default();
        for &opt in opts {
            match opt {
                "" => {}
                "rtscts" => settings.flow = FLOWCONTROL_RTS_CTS,
                "xonxoff" => settings.flow = FLOWCONTROL_XON_XOFF,
                "local" => settings.local = true,
                speed => settings.parse_speed(speed)?,
            }
        }
        Ok(settings)
    }

    fn parse_speed(&mut self, speed: &str) -> Result<()> {
        let bad = || Error::invalid(format!("serialdev: bad speed setting {speed:?}"));
        let digits = speed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(speed.len());
        self.baud = speed[..digits].parse().map_err(|_| bad())?;

        let mut rest = speed[digits..].chars();
        if let Some(p) = rest.next() {
            self.parity = match p.to_ascii_lowercase() {
                'n' => PARITY_NONE,
                'o' => PARITY_ODD,
                'e' => PARITY_EVEN,
                'm' => PARITY_MARK,
                's' => PARITY_SPACE,
                _ => return Err(bad()),
            };
        }
        if let Some(d) = rest.next() {
            self.datasize = match d.to_digit(10) {
                Some(d @ 5..=8) => d,
                _ => return Err(bad()),
            };
        }
        if let Some(s) = rest.next() {
            self.stopbits = match s.to_digit(10) {
                Some(s @ 1..=2) => s,
                _ => return Err(bad()),
            };
        }
        if rest.next().is_some() {
            return Err(bad());
        }
        Ok(())
    }

    fn apply(&self, fd: &File) -> Result<()> {
        let mut t = tcgetattr(fd)?;
        t.make_raw();
        set(&mut t, SerialOp::Baud, self.baud)?;
        set(&mut t, SerialOp::Datasize, self.datasize)?;
        set(&mut t, SerialOp::Parity, self.parity)?;
        set(&mut t, SerialOp::Stopbits, self.stopbits)?;
        set(&mut t, SerialOp::FlowControl, self.flow)?;
        set(&mut t, SerialOp::IFlowControl, self.flow)?;
        t.control_modes.insert(ControlModes::CREAD);
        t.control_modes.set(ControlModes::CLOCAL, self.local);
        tcsetattr(fd, OptionalActions::Now, &t)?;
        Ok(())
    }
}

const SIZES: [(u32, ControlModes); 4] = [
    (5, ControlModes::CS5),
    (6, ControlModes::CS6),
    (7, ControlModes::CS7),
    (8, ControlModes::CS8),
];

#[cfg(any(target_os = "linux", target_os = "android"))]
const STICKY_PARITY: ControlModes = ControlModes::CMSPAR;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const STICKY_PARITY: ControlModes = ControlModes::empty();

fn set(t: &mut Termios, op: SerialOp, value: u32) -> Result<()> {
    let bad = || Error::invalid(format!("{op:?} cannot be set to {value}"));
    match op {
        SerialOp::Baud => t.set_speed(value)?,
        SerialOp::Datasize => {
            let (_, bits) = SIZES.iter().find(|(n, _)| *n == value).ok_or_else(bad)?;
            t.control_modes.remove(ControlModes::CSIZE);
            t.control_modes.insert(*bits);
        }
        SerialOp::Parity => {
            let bits = match value {
                PARITY_NONE => ControlModes::empty(),
                PARITY_ODD => ControlModes::PARENB | ControlModes::PARODD,
                PARITY_EVEN => ControlModes::PARENB,
                PARITY_MARK | PARITY_SPACE if STICKY_PARITY.is_empty() => {
                    return Err(Error::NotSupported)
                }
                PARITY_MARK => ControlModes::PARENB | ControlModes::PARODD | STICKY_PARITY,
                PARITY_SPACE => ControlModes::PARENB | STICKY_PARITY,
                _ => return Err(bad()),
            };
            t.control_modes.remove(ControlModes::PARENB | ControlModes::PARODD | STICKY_PARITY);
            t.control_modes.insert(bits);
        }
        SerialOp::Stopbits => match value {
            1 => t.control_modes.remove(ControlModes::CSTOPB),
            2 => t.control_modes.insert(ControlModes::CSTOPB),
            _ => return Err(bad()),
        },
        SerialOp::FlowControl => match value {
            FLOWCONTROL_NONE => {
                t.control_modes.remove(ControlModes::CRTSCTS);
                t.input_modes.remove(InputModes::IXON);
            }
            FLOWCONTROL_XON_XOFF => {
                t.control_modes.remove(ControlModes::CRTSCTS);
                t.input_modes.insert(InputModes::IXON);
            }
            FLOWCONTROL_RTS_CTS => {
                t.control_modes.insert(ControlModes::CRTSCTS);
                t.input_modes.remove(InputModes::IXON);
            }
            _ => return Err(bad()),
        },
        SerialOp::IFlowControl => match value {
            FLOWCONTROL_NONE => t.input_modes.remove(InputModes::IXOFF),
            FLOWCONTROL_XON_XOFF => t.input_modes.insert(InputModes::IXOFF),
            FLOWCONTROL_RTS_CTS => {
                t.control_modes.insert(ControlModes::CRTSCTS);
                t.input_modes.remove(InputModes::IXOFF);
            }
            _ => return Err(bad()),
        },
        _ => return Err(Error::NotSupported),
    }
    Ok(())
}

fn get(t: &Termios, op: SerialOp) -> Result<u32> {
    let cm = t.control_modes;
    Ok(match op {
        SerialOp::Baud => t.output_speed(),
        SerialOp::Datasize => SIZES
            .iter()
            .find(|(_, bits)| cm & ControlModes::CSIZE == *bits)
            .map_or(8, |(n, _)| *n),
        SerialOp::Parity => {
            let sticky = !STICKY_PARITY.is_empty() && cm.contains(STICKY_PARITY);
            match (
                cm.contains(ControlModes::PARENB),
                cm.contains(ControlModes::PARODD),
                sticky,
            ) {
                (false, _, _) => PARITY_NONE,
                (true, true, false) => PARITY_ODD,
                (true, false, false) => PARITY_EVEN,
                (true, true, true) => PARITY_MARK,
                (true, false, true) => PARITY_SPACE,
            }
        }
        SerialOp::Stopbits => {
            if cm.contains(ControlModes::CSTOPB) {
                2
            } else {
                1
            }
        }
        SerialOp::FlowControl => {
            if cm.contains(ControlModes::CRTSCTS) {
                FLOWCONTROL_RTS_CTS
            } else if t.input_modes.contains(InputModes::IXON) {
                FLOWCONTROL_XON_XOFF
            } else {
                FLOWCONTROL_NONE
            }
        }
        SerialOp::IFlowControl => {
            if t.input_modes.contains(InputModes::IXOFF) {
                FLOWCONTROL_XON_XOFF
            } else if cm.contains(ControlModes::CRTSCTS) {
                FLOWCONTROL_RTS_CTS
            } else {
                FLOWCONTROL_NONE
            }
        }
        _ => return Err(Error::NotSupported),
    })
}

/// Termios-backed serial control for an open port.
struct SerialDev {
    handle: FdHandle,
}

impl SerialControl for SerialDev {
    fn serial_op(&self, op: SerialOp, value: u32, done: Option<SerialDone>) -> Result<()> {
        let current = self.handle.with_control(|fd| {
            let mut t = tcgetattr(fd)?;
            if value != 0 {
                set(&mut t, op, value)?;
                tcsetattr(fd, OptionalActions::Now, &t)?;
                t = tcgetattr(fd)?;
            }
            get(&t, op)
        })?;
        tracing::trace!(?op, value, current, "serial op");
        if let Some(done) = done {
            self.handle.os().schedule(Box::new(move || {
                let _ = guarded("serial op completion", || {
                    done(Ok(current));
                    Ok(())
                });
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_strings() {
        let s = LineSettings::parse(&["19200e71", "rtscts"]).unwrap();
        assert_eq!(
            s,
            LineSettings {
                baud: 19200,
                datasize: 7,
                parity: PARITY_EVEN,
                stopbits: 1,
                flow: FLOWCONTROL_RTS_CTS,
                local: false,
            }
        );
        assert_eq!(LineSettings::parse(&[]).unwrap(), LineSettings::default());
        let s = LineSettings::parse(&["115200", "local"]).unwrap();
        assert_eq!((s.baud, s.parity, s.local), (115200, PARITY_NONE, true));
        assert!(LineSettings::parse(&["9600x81"]).is_err());
        assert!(LineSettings::parse(&["9600n91"]).is_err());
        assert!(LineSettings::parse(&["9600n813"]).is_err());
        assert!(LineSettings::parse(&["fast"]).is_err());
    }
}
