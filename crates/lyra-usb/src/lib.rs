//! Emulated USB peripheral devices for a virtual host controller.
//!
//! The external controller owns the schedule and drives devices one packet at
//! a time: each transaction is a call into [`UsbPort::dispatch`] (or directly
//! into [`AttachedUsbDevice::dispatch`]) carrying a token (SETUP/IN/OUT), the
//! target device address and endpoint, and a transfer buffer. The generic
//! device layer decodes SETUP packets, runs the control-transfer staging
//! machine and the standard request table, and forwards everything else to the
//! concrete [`UsbBackend`].
//!
//! Two backends ship with the crate: an isochronous webcam with an emulated
//! register/I2C bridge ([`webcam::WebcamBackend`]) and a joystick-to-gamepad
//! translator with force feedback ([`pad::GamepadBackend`]).

pub mod device;
pub mod pad;
pub mod port;
pub mod settings;
pub mod webcam;

pub use device::{AttachedUsbDevice, DescriptorSet, UsbBackend, UsbDeviceState};
pub use port::{PortEvents, UsbPort};

use thiserror::Error;

/// Direction/phase tag the controller attaches to each packet call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbToken {
    Setup,
    In,
    Out,
}

impl UsbToken {
    /// Decodes a raw USB packet identifier (SETUP 0x2D, IN 0x69, OUT 0xE1).
    pub fn from_pid(pid: u8) -> Option<Self> {
        match pid {
            0x2D => Some(Self::Setup),
            0x69 => Some(Self::In),
            0xE1 => Some(Self::Out),
            _ => None,
        }
    }

    pub fn pid(self) -> u8 {
        match self {
            Self::Setup => 0x2D,
            Self::In => 0x69,
            Self::Out => 0xE1,
        }
    }
}

/// Line speed reported for an emulated device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UsbSpeed {
    Low,
    Full,
}

/// Transfer-level failure, reported to the controller in place of a byte
/// count. Variants mirror the classic host-controller completion codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum UsbError {
    /// No device answered: nothing attached, the address did not match, or the
    /// backend has been torn down.
    #[error("no device")]
    NoDevice,
    /// Transient not-ready. Retrying is the controller's policy, never ours.
    #[error("nak")]
    Nak,
    /// Protocol violation: unsupported request, out-of-range feature or
    /// descriptor index, malformed control sequence.
    #[error("stall")]
    Stall,
    /// The host announced more data than the protocol window allows.
    #[error("babble")]
    Babble,
    /// Backend-level I/O failure, e.g. the host joystick went away.
    #[error("i/o error")]
    Io,
}

pub type UsbResult<T> = Result<T, UsbError>;

/// Decoded direction bit of `bmRequestType`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

/// Decoded type field of `bmRequestType`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Decoded recipient field of `bmRequestType`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Decoded 8-byte SETUP packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn request_direction(&self) -> RequestDirection {
        if self.bm_request_type & 0x80 != 0 {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.bm_request_type & 0x1F {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            _ => RequestRecipient::Other,
        }
    }

    /// Combined `(bmRequestType << 8) | bRequest` word handed to backends.
    pub fn request_word(&self) -> u16 {
        u16::from(self.bm_request_type) << 8 | u16::from(self.b_request)
    }
}

// Standard request codes (USB 2.0 table 9-4).
pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_GET_CONFIGURATION: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_GET_INTERFACE: u8 = 0x0A;
pub const REQ_SET_INTERFACE: u8 = 0x0B;

// Descriptor types.
pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;

// Feature selectors for SET_FEATURE/CLEAR_FEATURE.
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x0001;

// Combined request words (`bmRequestType << 8 | bRequest` with bRequest left
// to the caller). Controllers and backends address control requests in this
// form.
pub const DEVICE_REQUEST: u16 = 0x8000;
pub const DEVICE_OUT_REQUEST: u16 = 0x0000;
pub const INTERFACE_REQUEST: u16 = 0x8100;
pub const INTERFACE_OUT_REQUEST: u16 = 0x0100;
pub const ENDPOINT_REQUEST: u16 = 0x8200;
pub const ENDPOINT_OUT_REQUEST: u16 = 0x0200;
pub const VENDOR_DEVICE_REQUEST: u16 = 0xC000;
pub const VENDOR_DEVICE_OUT_REQUEST: u16 = 0x4000;
pub const CLASS_INTERFACE_REQUEST: u16 = 0xA100;
pub const CLASS_INTERFACE_OUT_REQUEST: u16 = 0x2100;
