#![allow(dead_code)]

use lyra_usb::{PortEvents, UsbPort, UsbResult, UsbToken};

/// Records port notifications the way a controller would see them.
#[derive(Default)]
pub struct EventLog {
    pub attaches: Vec<usize>,
    pub detaches: Vec<usize>,
    pub wakeups: Vec<usize>,
}

impl PortEvents for EventLog {
    fn attach(&mut self, port: usize) {
        self.attaches.push(port);
    }

    fn detach(&mut self, port: usize) {
        self.detaches.push(port);
    }

    fn wakeup(&mut self, port: usize) {
        self.wakeups.push(port);
    }
}

pub fn setup_bytes(bm: u8, req: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [v0, v1] = value.to_le_bytes();
    let [i0, i1] = index.to_le_bytes();
    let [l0, l1] = length.to_le_bytes();
    [bm, req, v0, v1, i0, i1, l0, l1]
}

/// Full control read as a controller would schedule it: SETUP, IN data stage
/// in 8-byte windows (the control endpoint's max packet size), OUT status.
pub fn control_read(
    port: &mut UsbPort,
    addr: u8,
    bm: u8,
    req: u8,
    value: u16,
    index: u16,
    length: u16,
) -> UsbResult<Vec<u8>> {
    let mut setup = setup_bytes(bm, req, value, index, length);
    port.dispatch(UsbToken::Setup, addr, 0, &mut setup)?;

    let mut out = Vec::new();
    loop {
        let mut window = [0u8; 8];
        let n = port.dispatch(UsbToken::In, addr, 0, &mut window)?;
        out.extend_from_slice(&window[..n]);
        if n < window.len() || out.len() >= usize::from(length) {
            break;
        }
    }
    port.dispatch(UsbToken::Out, addr, 0, &mut [])?;
    Ok(out)
}

/// Full control write: SETUP, OUT data stage (if any), IN status stage.
pub fn control_write(
    port: &mut UsbPort,
    addr: u8,
    bm: u8,
    req: u8,
    value: u16,
    index: u16,
    data: &[u8],
) -> UsbResult<()> {
    let mut setup = setup_bytes(bm, req, value, index, data.len() as u16);
    port.dispatch(UsbToken::Setup, addr, 0, &mut setup)?;
    if !data.is_empty() {
        let mut payload = data.to_vec();
        port.dispatch(UsbToken::Out, addr, 0, &mut payload)?;
    }
    port.dispatch(UsbToken::In, addr, 0, &mut [])?;
    Ok(())
}
