//! Joystick-to-gamepad device backend.
//!
//! Translates a host joystick's input snapshots into the emulated gamepad's
//! HID input reports and carries force-feedback commands the other way. The
//! host device itself (enumeration, event plumbing) lives behind the
//! [`HostJoystick`] trait; the backend owns the handle between `open` and
//! `close` and guarantees it is released on every exit path.

use std::io;

use tracing::{debug, trace, warn};

use crate::device::{AttachedUsbDevice, DescriptorSet, UsbBackend};
use crate::settings::{DeviceKey, SettingsStore};
use crate::{
    UsbError, UsbResult, UsbSpeed, UsbToken, CLASS_INTERFACE_OUT_REQUEST, CLASS_INTERFACE_REQUEST,
    INTERFACE_REQUEST, REQ_GET_DESCRIPTOR,
};

pub const REPORT_LEN: usize = 8;

const INPUT_ENDPOINT: u8 = 1;
const OUTPUT_ENDPOINT: u8 = 2;

/// Settings section name for this backend.
const SETTINGS_KIND: &str = "pad";

// Absolute axis codes reported by `HostJoystick::axis_code` (evdev
// numbering).
pub const ABS_X: u8 = 0x00;
pub const ABS_Y: u8 = 0x01;
pub const ABS_Z: u8 = 0x02;
pub const ABS_RX: u8 = 0x03;
pub const ABS_RY: u8 = 0x04;
pub const ABS_RZ: u8 = 0x05;
pub const ABS_HAT0X: u8 = 0x10;
pub const ABS_HAT0Y: u8 = 0x11;
pub const ABS_MAX: usize = 0x3F;

// Button code block dedicated to gamepads (BTN_GAMEPAD..=BTN_THUMBR).
pub const BTN_GAMEPAD_FIRST: u16 = 0x130;
pub const BTN_GAMEPAD_LAST: u16 = 0x13E;

// HID class requests (combined request words).
const HID_GET_REPORT: u16 = CLASS_INTERFACE_REQUEST | 0x01;
const HID_GET_IDLE: u16 = CLASS_INTERFACE_REQUEST | 0x02;
const HID_GET_PROTOCOL: u16 = CLASS_INTERFACE_REQUEST | 0x03;
const HID_SET_REPORT: u16 = CLASS_INTERFACE_OUT_REQUEST | 0x09;
const HID_SET_IDLE: u16 = CLASS_INTERFACE_OUT_REQUEST | 0x0A;
const HID_SET_PROTOCOL: u16 = CLASS_INTERFACE_OUT_REQUEST | 0x0B;

const INTERFACE_GET_DESCRIPTOR: u16 = INTERFACE_REQUEST | REQ_GET_DESCRIPTOR as u16;

const DESC_HID: u8 = 0x21;
const DESC_REPORT: u8 = 0x22;

const REPORT_DESCRIPTOR_LEN: u8 = 76;

static DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, // bLength
    0x01, // bDescriptorType (Device)
    0x00, 0x02, // bcdUSB 2.00
    0x00, // bDeviceClass (per interface)
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    0x40, // bMaxPacketSize0
    0x34, 0x12, // idVendor 0x1234
    0x03, 0x00, // idProduct 0x0003
    0x00, 0x01, // bcdDevice 1.00
    0x01, // iManufacturer
    0x02, // iProduct
    0x00, // iSerialNumber
    0x01, // bNumConfigurations
];

static CONFIG_DESCRIPTOR: [u8; 41] = [
    0x09, // bLength
    0x02, // bDescriptorType (Configuration)
    41, 0x00, // wTotalLength
    0x01, // bNumInterfaces
    0x01, // bConfigurationValue
    0x00, // iConfiguration
    0xA0, // bmAttributes (bus powered, remote wakeup)
    50,   // bMaxPower (100mA)
    // Interface descriptor (HID).
    0x09, 0x04, 0x00, 0x00, 0x02, 0x03, 0x00, 0x00, 0x00,
    // HID descriptor.
    0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, REPORT_DESCRIPTOR_LEN, 0x00,
    // Endpoint descriptor: interrupt IN, input reports.
    0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0A,
    // Endpoint descriptor: interrupt OUT, force feedback.
    0x07, 0x05, 0x02, 0x03, 0x08, 0x00, 0x0A,
];

#[rustfmt::skip]
static REPORT_DESCRIPTOR: [u8; REPORT_DESCRIPTOR_LEN as usize] = [
    0x05, 0x01,       // Usage Page (Generic Desktop)
    0x09, 0x05,       // Usage (Game Pad)
    0xA1, 0x01,       // Collection (Application)
    0x05, 0x09,       //   Usage Page (Button)
    0x19, 0x01,       //   Usage Minimum (Button 1)
    0x29, 0x10,       //   Usage Maximum (Button 16)
    0x15, 0x00,       //   Logical Minimum (0)
    0x25, 0x01,       //   Logical Maximum (1)
    0x75, 0x01,       //   Report Size (1)
    0x95, 0x10,       //   Report Count (16)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x05, 0x01,       //   Usage Page (Generic Desktop)
    0x09, 0x39,       //   Usage (Hat switch)
    0x15, 0x00,       //   Logical Minimum (0)
    0x25, 0x07,       //   Logical Maximum (7)
    0x35, 0x00,       //   Physical Minimum (0)
    0x46, 0x3B, 0x01, //   Physical Maximum (315)
    0x65, 0x14,       //   Unit (Degrees)
    0x75, 0x04,       //   Report Size (4)
    0x95, 0x01,       //   Report Count (1)
    0x81, 0x42,       //   Input (Data,Var,Abs,Null)
    0x65, 0x00,       //   Unit (None)
    0x75, 0x04,       //   Report Size (4)
    0x95, 0x01,       //   Report Count (1)
    0x81, 0x01,       //   Input (Const) padding
    0x09, 0x30,       //   Usage (X)
    0x09, 0x31,       //   Usage (Y)
    0x09, 0x33,       //   Usage (Rx)
    0x09, 0x34,       //   Usage (Ry)
    0x15, 0x81,       //   Logical Minimum (-127)
    0x25, 0x7F,       //   Logical Maximum (127)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x04,       //   Report Count (4)
    0x81, 0x02,       //   Input (Data,Var,Abs)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x01,       //   Report Count (1)
    0x81, 0x01,       //   Input (Const) padding
    0xC0,             // End Collection
];

/// Host joystick handle. Implementations wrap the platform's input API;
/// values follow the joystick convention of signed 16-bit axes.
pub trait HostJoystick {
    fn name(&self) -> &str;

    fn num_axes(&self) -> usize;

    fn num_buttons(&self) -> usize;

    /// Absolute axis code backing axis slot `slot`.
    fn axis_code(&self, slot: usize) -> u8;

    /// Key code backing button slot `slot`.
    fn button_code(&self, slot: usize) -> u16;

    /// Refreshes the input snapshot from the host device.
    fn poll(&mut self) -> io::Result<()>;

    /// Latest snapshot value for axis slot `slot`, -32767..=32767.
    fn axis_value(&self, slot: usize) -> i16;

    fn button_pressed(&self, slot: usize) -> bool;

    /// Hands over the force-feedback channel if the device has one. Called
    /// once during open; the backend owns the channel until close.
    fn take_force_feedback(&mut self) -> Option<Box<dyn ForceFeedbackChannel>>;
}

/// Command forwarded to the host force-feedback resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FfCommand {
    Rumble { strong: u8, weak: u8 },
    Stop,
}

impl FfCommand {
    /// Decodes a host-bound output report: byte 0 drives the strong motor,
    /// byte 1 the weak motor; all zeroes stop both.
    pub fn parse(data: &[u8]) -> Self {
        let strong = data.first().copied().unwrap_or(0);
        let weak = data.get(1).copied().unwrap_or(0);
        if strong == 0 && weak == 0 {
            Self::Stop
        } else {
            Self::Rumble { strong, weak }
        }
    }
}

pub trait ForceFeedbackChannel {
    fn apply(&mut self, command: FfCommand);
}

/// Rest-position classification of the ABS_RZ axis, decided once at open.
///
/// Dual-analog devices center the right stick's vertical axis at zero;
/// trigger-style axes rest at the range minimum and need recentering before
/// they fit a signed report field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AxisCentering {
    Centered,
    RangeMin,
}

/// 8-byte gamepad input report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GamepadReport {
    pub buttons: u16,
    /// Hat switch direction (0..=7 clockwise from north); 8 is the centered
    /// null state.
    pub hat: u8,
    pub x: i8,
    pub y: i8,
    pub rx: i8,
    pub ry: i8,
}

impl Default for GamepadReport {
    fn default() -> Self {
        Self {
            buttons: 0,
            hat: 8,
            x: 0,
            y: 0,
            rx: 0,
            ry: 0,
        }
    }
}

impl GamepadReport {
    pub fn to_bytes(self) -> [u8; REPORT_LEN] {
        let [b0, b1] = self.buttons.to_le_bytes();
        [
            b0,
            b1,
            self.hat & 0x0F,
            self.x as u8,
            self.y as u8,
            self.rx as u8,
            self.ry as u8,
            0x00,
        ]
    }
}

/// Gamepad device backend bound to one host joystick.
pub struct GamepadBackend {
    host: Option<Box<dyn HostJoystick>>,
    ff: Option<Box<dyn ForceFeedbackChannel>>,
    axis_map: [u8; ABS_MAX + 1],
    button_map: Vec<u8>,
    axis_inverted: [bool; 3],
    axis_count: usize,
    button_count: usize,
    is_gamepad: bool,
    centering: AxisCentering,
    idle_rate: u8,
    protocol: u8,
}

impl GamepadBackend {
    /// Acquires the host joystick and builds the translation maps.
    ///
    /// The handle is owned by the returned backend; on any failure here it is
    /// dropped (released) before the error surfaces.
    pub fn open(
        mut host: Box<dyn HostJoystick>,
        settings: &dyn SettingsStore,
        port: u8,
    ) -> UsbResult<Self> {
        host.poll().map_err(|err| {
            warn!(port, %err, "joystick unavailable");
            UsbError::Io
        })?;

        let axis_count = host.num_axes();
        let button_count = host.num_buttons();
        if axis_count == 0 && button_count == 0 {
            warn!(port, "host device reports no axes and no buttons");
            return Err(UsbError::Io);
        }

        let key = DeviceKey::new(SETTINGS_KIND, port);

        let mut axis_map = [0u8; ABS_MAX + 1];
        for (slot, entry) in axis_map.iter_mut().enumerate().take(axis_count) {
            *entry = settings
                .get_i32(key, &format!("axis{slot}"))
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or_else(|| host.axis_code(slot));
        }

        let mut button_map = Vec::with_capacity(button_count);
        let mut is_gamepad = false;
        for slot in 0..button_count {
            let code = host.button_code(slot);
            if (BTN_GAMEPAD_FIRST..=BTN_GAMEPAD_LAST).contains(&code) {
                is_gamepad = true;
            }
            let bit = settings
                .get_i32(key, &format!("button{slot}"))
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or_else(|| default_button_bit(code, slot));
            button_map.push(bit);
        }

        let axis_inverted = [
            settings.get_bool(key, "reverse_x").unwrap_or(false),
            settings.get_bool(key, "reverse_y").unwrap_or(false),
            settings.get_bool(key, "reverse_rz").unwrap_or(false),
        ];

        let centering = calibrate_rz(host.as_ref(), &axis_map, axis_count);
        let ff = host.take_force_feedback();
        if ff.is_none() {
            debug!(port, "no force feedback channel, rumble will be dropped");
        }

        debug!(
            port,
            name = host.name(),
            axes = axis_count,
            buttons = button_count,
            is_gamepad,
            ?centering,
            "joystick opened"
        );

        Ok(Self {
            host: Some(host),
            ff,
            axis_map,
            button_map,
            axis_inverted,
            axis_count,
            button_count,
            is_gamepad,
            centering,
            idle_rate: 0,
            protocol: 1,
        })
    }

    pub fn descriptors() -> DescriptorSet {
        DescriptorSet {
            device: &DEVICE_DESCRIPTOR,
            configuration: &CONFIG_DESCRIPTOR,
            strings: &["Lyra", "Lyra Gamepad"],
            num_interfaces: 1,
        }
    }

    /// Wraps the backend in the generic device layer.
    pub fn into_device(self) -> AttachedUsbDevice {
        AttachedUsbDevice::new(Self::descriptors(), Box::new(self), UsbSpeed::Full)
    }

    pub fn is_gamepad(&self) -> bool {
        self.is_gamepad
    }

    pub fn centering(&self) -> AxisCentering {
        self.centering
    }

    /// Releases the host joystick and force-feedback handles. Safe to call
    /// any number of times; transfers after close report `NoDevice`.
    pub fn close(&mut self) {
        if self.host.take().is_some() {
            debug!("joystick closed");
        }
        self.ff = None;
    }

    /// Folds the latest host snapshot through the translation maps.
    fn build_report(&self) -> [u8; REPORT_LEN] {
        let Some(host) = self.host.as_deref() else {
            return GamepadReport::default().to_bytes();
        };

        let mut report = GamepadReport::default();
        let mut hat_x = 0i16;
        let mut hat_y = 0i16;
        for slot in 0..self.axis_count.min(self.axis_map.len()) {
            let raw = host.axis_value(slot);
            match self.axis_map[slot] {
                ABS_X => report.x = scale_axis(i32::from(raw), self.axis_inverted[0]),
                ABS_Y => report.y = scale_axis(i32::from(raw), self.axis_inverted[1]),
                ABS_RX => report.rx = scale_axis(i32::from(raw), false),
                ABS_RY => report.ry = scale_axis(i32::from(raw), false),
                ABS_RZ => {
                    let centered = match self.centering {
                        AxisCentering::Centered => i32::from(raw),
                        // Trigger-style axis resting at the range minimum;
                        // shift it into the signed range first.
                        AxisCentering::RangeMin => i32::from(raw) / 2 + 16384,
                    };
                    report.ry = scale_axis(centered, self.axis_inverted[2]);
                }
                ABS_HAT0X => hat_x = raw,
                ABS_HAT0Y => hat_y = raw,
                _ => {}
            }
        }
        report.hat = hat_direction(hat_x, hat_y);

        for slot in 0..self.button_count.min(self.button_map.len()) {
            if host.button_pressed(slot) {
                let bit = self.button_map[slot];
                if bit < 16 {
                    report.buttons |= 1 << bit;
                }
            }
        }

        report.to_bytes()
    }

    fn forward_ff(&mut self, data: &[u8]) {
        let command = FfCommand::parse(data);
        if let Some(ff) = self.ff.as_mut() {
            trace!(?command, "force feedback command");
            ff.apply(command);
        }
    }
}

fn default_button_bit(code: u16, slot: usize) -> u8 {
    if (BTN_GAMEPAD_FIRST..=BTN_GAMEPAD_LAST).contains(&code) {
        (code - BTN_GAMEPAD_FIRST) as u8
    } else {
        slot.min(u8::MAX as usize) as u8
    }
}

/// Dual-analog detection: sample the ABS_RZ slot once at rest. Zero means a
/// centered second stick; anything else is treated as a trigger resting at
/// its range minimum.
fn calibrate_rz(host: &dyn HostJoystick, axis_map: &[u8], axis_count: usize) -> AxisCentering {
    for slot in 0..axis_count.min(axis_map.len()) {
        if axis_map[slot] == ABS_RZ {
            return if host.axis_value(slot) == 0 {
                AxisCentering::Centered
            } else {
                AxisCentering::RangeMin
            };
        }
    }
    AxisCentering::RangeMin
}

fn scale_axis(raw: i32, inverted: bool) -> i8 {
    let value = (raw / 258).clamp(-127, 127) as i8;
    if inverted {
        -value
    } else {
        value
    }
}

fn hat_direction(x: i16, y: i16) -> u8 {
    match (x.signum(), y.signum()) {
        (0, -1) => 0, // N
        (1, -1) => 1, // NE
        (1, 0) => 2,  // E
        (1, 1) => 3,  // SE
        (0, 1) => 4,  // S
        (-1, 1) => 5, // SW
        (-1, 0) => 6, // W
        (-1, -1) => 7, // NW
        _ => 8,       // centered
    }
}

impl UsbBackend for GamepadBackend {
    fn reset(&mut self) {
        // No internal protocol state needs resynchronizing.
    }

    fn control(&mut self, request: u16, value: u16, _index: u16, data: &mut [u8])
        -> UsbResult<usize> {
        if self.host.is_none() {
            return Err(UsbError::NoDevice);
        }
        match request {
            HID_GET_REPORT => {
                let report = self.build_report();
                let len = data.len().min(report.len());
                data[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            HID_GET_IDLE => {
                let Some(out) = data.first_mut() else {
                    return Err(UsbError::Stall);
                };
                *out = self.idle_rate;
                Ok(1)
            }
            HID_GET_PROTOCOL => {
                let Some(out) = data.first_mut() else {
                    return Err(UsbError::Stall);
                };
                *out = self.protocol;
                Ok(1)
            }
            HID_SET_IDLE => {
                self.idle_rate = (value >> 8) as u8;
                Ok(0)
            }
            HID_SET_PROTOCOL => {
                if value > 1 {
                    return Err(UsbError::Stall);
                }
                self.protocol = value as u8;
                Ok(0)
            }
            // Output reports carry force feedback, same as the OUT endpoint.
            HID_SET_REPORT => {
                self.forward_ff(data);
                Ok(data.len())
            }
            INTERFACE_GET_DESCRIPTOR => {
                let descriptor: &[u8] = match (value >> 8) as u8 {
                    DESC_HID => &CONFIG_DESCRIPTOR[18..27],
                    DESC_REPORT => &REPORT_DESCRIPTOR,
                    _ => return Err(UsbError::Stall),
                };
                let len = data.len().min(descriptor.len());
                data[..len].copy_from_slice(&descriptor[..len]);
                Ok(len)
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn data(&mut self, token: UsbToken, endpoint: u8, buf: &mut [u8]) -> UsbResult<usize> {
        if self.host.is_none() {
            return Err(UsbError::NoDevice);
        }
        match (token, endpoint) {
            (UsbToken::In, INPUT_ENDPOINT) => {
                if let Some(host) = self.host.as_mut() {
                    host.poll().map_err(|err| {
                        warn!(%err, "joystick read failed");
                        UsbError::Io
                    })?;
                }
                let report = self.build_report();
                let len = buf.len().min(report.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            (UsbToken::Out, OUTPUT_ENDPOINT) => {
                self.forward_ff(buf);
                Ok(buf.len())
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn detach(&mut self) {
        self.close();
    }
}
