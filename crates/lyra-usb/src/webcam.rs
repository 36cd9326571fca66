//! Webcam device backend: an OV519-style USB bridge in front of an OV764x
//! sensor, streaming video over isochronous endpoint 1 and silence over
//! audio endpoint 2.
//!
//! The guest programs the camera through two vendor control requests that
//! read and write a 256-entry bridge register file. Sensor registers sit
//! behind a second, I2C-like bus emulated on top of the bridge registers:
//! the guest loads address/data latch registers and then pokes the I2C
//! control register to commit a transfer.

use tracing::{debug, trace, warn};

use crate::device::{AttachedUsbDevice, DescriptorSet, UsbBackend};
use crate::{
    UsbError, UsbResult, UsbSpeed, UsbToken, VENDOR_DEVICE_OUT_REQUEST, VENDOR_DEVICE_REQUEST,
};

pub const VIDEO_ENDPOINT: u8 = 1;
pub const AUDIO_ENDPOINT: u8 = 2;

/// Frame geometry assumed when no frame source is attached.
const DEFAULT_FRAME_WIDTH: usize = 320;
const DEFAULT_FRAME_HEIGHT: usize = 240;

const FRAME_HEADER_LEN: usize = 16;

// Bridge register file indices.
const OV519_R10_H_SIZE: u8 = 0x10;
const OV519_R11_V_SIZE: u8 = 0x11;
const OV519_R51_RESET1: u8 = 0x51;
const OV519_FRAME_COUNTER: u8 = 0xEA;

// I2C latch block. Writes commit through SADDR_3/DATA, reads through
// SADDR_2 with the result surfacing in DATA.
const R51X_I2C_W_SID: u8 = 0x41;
const R51X_I2C_SADDR_3: u8 = 0x42;
const R51X_I2C_SADDR_2: u8 = 0x43;
const R51X_I2C_DATA: u8 = 0x45;
const R518_I2C_CTL: u8 = 0x47;

/// RESET1 bit that flushes the video FIFO.
const RESET1_FIFO: u8 = 0x08;

/// Sensor common-control register A; writing it with the top bit set re-runs
/// the sensor power-on sequence.
const SENSOR_COM_A: u8 = 0x12;

// Vendor control requests (combined request words).
const VENDOR_REG_READ: u16 = VENDOR_DEVICE_REQUEST | 0x01;
const VENDOR_REG_WRITE: u16 = VENDOR_DEVICE_OUT_REQUEST | 0x01;

// Frame chunk markers (header byte 3).
const CHUNK_START_OF_FRAME: u8 = 0x50;
const CHUNK_END_OF_FRAME: u8 = 0x51;

/// External producer of raw frame bytes. The backend never interprets the
/// pixel format; it only chunks whatever the source hands over.
pub trait FrameSource {
    /// Size in bytes of the current frame.
    fn frame_len(&self) -> usize;

    /// Copies `out.len()` frame bytes starting at `offset` into `out`.
    fn copy_frame(&mut self, offset: usize, out: &mut [u8]);
}

/// OV764x power-on defaults, applied at construction and on every sensor
/// reset.
#[rustfmt::skip]
const SENSOR_DEFAULTS: [(u8, u8); 46] = [
    (0x00, 0x00), // gain
    (0x01, 0x80), // blue balance
    (0x02, 0x80), // red balance
    (0x03, 0x84), // saturation
    (0x04, 0x34), // hue
    (0x05, 0x3E), // AWB
    (0x06, 0x80), // ABC brightness
    (0x0A, 0x76), // product ID, read-only
    (0x0B, 0x48), // product version, read-only
    (0x10, 0x41), // exposure
    (0x11, 0x00), // clock
    (0x12, 0x14), // common A
    (0x13, 0xA3), // common B
    (0x14, 0x04), // common C
    (0x15, 0x00), // common D
    (0x17, 0x1A), // hstart
    (0x18, 0xBA), // hstop
    (0x19, 0x03), // vstart
    (0x1A, 0xF3), // vstop
    (0x1B, 0x00), // pixel shift
    (0x1C, 0x7F), // manufacturer ID high, read-only
    (0x1D, 0xA2), // manufacturer ID low, read-only
    (0x1F, 0x01), // output format
    (0x20, 0xC0), // common E
    (0x24, 0x10), // AEW
    (0x25, 0x8A), // AEB
    (0x26, 0xA2), // common F
    (0x27, 0xE2), // common G
    (0x28, 0x20), // common H
    (0x29, 0x00), // common I
    (0x2A, 0x00), // frame rate adjust high
    (0x2B, 0x00), // frame rate adjust low
    (0x2D, 0x81), // common J
    (0x60, 0x06), // signal process B
    (0x6C, 0x11), // color matrix R
    (0x6D, 0x01), // color matrix G
    (0x6E, 0x06), // color matrix B
    (0x71, 0x00), // common L
    (0x72, 0x10), // HSYNC rising
    (0x73, 0x50), // HSYNC falling
    (0x74, 0x20), // common M
    (0x75, 0x02), // common N
    (0x76, 0x00), // common O
    (0x7E, 0x00), // AVGY
    (0x7F, 0x00), // AVGR
    (0x80, 0x00), // AVGB
];

static DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, // bLength
    0x01, // bDescriptorType (Device)
    0x10, 0x01, // bcdUSB 1.10
    0x00, // bDeviceClass
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    0x08, // bMaxPacketSize0
    0x4C, 0x05, // idVendor 0x054C
    0x55, 0x01, // idProduct 0x0155
    0x00, 0x01, // bcdDevice 1.00
    0x01, // iManufacturer
    0x02, // iProduct
    0x00, // iSerialNumber
    0x01, // bNumConfigurations
];

static CONFIG_DESCRIPTOR: [u8; 180] = [
    0x09, // bLength
    0x02, // bDescriptorType (Configuration)
    0xB4, 0x00, // wTotalLength 180
    0x03, // bNumInterfaces
    0x01, // bConfigurationValue
    0x00, // iConfiguration
    0x90, // bmAttributes
    0xFA, // bMaxPower 500mA
    // Interface 0, alternate 0: video, zero-bandwidth.
    0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x01, 0x00, 0x00, 0x01, // iso IN, wMaxPacketSize 0
    // Interface 0, alternate 1.
    0x09, 0x04, 0x00, 0x01, 0x01, 0xFF, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x01, 0x80, 0x01, 0x01, // iso IN, wMaxPacketSize 384
    // Interface 0, alternate 2.
    0x09, 0x04, 0x00, 0x02, 0x01, 0xFF, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x01, 0x00, 0x02, 0x01, // iso IN, wMaxPacketSize 512
    // Interface 0, alternate 3.
    0x09, 0x04, 0x00, 0x03, 0x01, 0xFF, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x01, 0x00, 0x03, 0x01, // iso IN, wMaxPacketSize 768
    // Interface 0, alternate 4.
    0x09, 0x04, 0x00, 0x04, 0x01, 0xFF, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x01, 0x80, 0x03, 0x01, // iso IN, wMaxPacketSize 896
    // Interface 1: audio control.
    0x09, 0x04, 0x01, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x09, 0x24, 0x01, 0x00, 0x01, 0x1E, 0x00, 0x01, 0x02, // class header
    0x0C, 0x24, 0x02, 0x01, 0x01, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x00, // input terminal (microphone)
    0x09, 0x24, 0x03, 0x02, 0x01, 0x01, 0x00, 0x01, 0x00, // output terminal (USB streaming)
    // Interface 2, alternate 0: audio streaming, zero-bandwidth.
    0x09, 0x04, 0x02, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00,
    // Interface 2, alternate 1.
    0x09, 0x04, 0x02, 0x01, 0x01, 0x01, 0x02, 0x00, 0x00,
    0x07, 0x24, 0x01, 0x02, 0x01, 0x01, 0x00, // AS general, PCM
    0x0B, 0x24, 0x02, 0x01, 0x01, 0x02, 0x10, 0x01, 0x80, 0x3E, 0x00, // mono 16-bit 16kHz
    0x09, 0x05, 0x82, 0x05, 0x28, 0x00, 0x01, 0x00, 0x00, // iso IN, wMaxPacketSize 40
    0x07, 0x25, 0x01, 0x00, 0x00, 0x00, 0x00, // class endpoint
];

/// Emulated webcam hardware: bridge registers, sensor registers, and the
/// video frame chunker.
pub struct WebcamBackend {
    regs: [u8; 256],
    sensor_regs: [u8; 256],
    frame_offset: usize,
    sequence: u8,
    source: Option<Box<dyn FrameSource>>,
}

impl WebcamBackend {
    pub fn new(source: Option<Box<dyn FrameSource>>) -> Self {
        let mut backend = Self {
            regs: [0; 256],
            sensor_regs: [0; 256],
            frame_offset: 0,
            sequence: 0,
            source,
        };
        backend.reset_sensor();
        backend.regs[usize::from(OV519_R10_H_SIZE)] = (DEFAULT_FRAME_WIDTH >> 4) as u8;
        backend.regs[usize::from(OV519_R11_V_SIZE)] = (DEFAULT_FRAME_HEIGHT >> 3) as u8;
        backend
    }

    pub fn descriptors() -> DescriptorSet {
        DescriptorSet {
            device: &DEVICE_DESCRIPTOR,
            configuration: &CONFIG_DESCRIPTOR,
            strings: &["Sony corporation", "EyeToy USB camera Namtai"],
            num_interfaces: 3,
        }
    }

    /// Wraps the backend in the generic device layer.
    pub fn into_device(self) -> AttachedUsbDevice {
        AttachedUsbDevice::new(Self::descriptors(), Box::new(self), UsbSpeed::Full)
    }

    fn frame_len(&self) -> usize {
        self.source
            .as_ref()
            .map(|s| s.frame_len())
            .unwrap_or(DEFAULT_FRAME_WIDTH * DEFAULT_FRAME_HEIGHT)
    }

    fn reset_sensor(&mut self) {
        self.sensor_regs = [0; 256];
        for &(reg, value) in SENSOR_DEFAULTS.iter() {
            self.sensor_regs[usize::from(reg)] = value;
        }
    }

    fn write_reg(&mut self, reg: u8, value: u8) {
        if !(R51X_I2C_W_SID..=R518_I2C_CTL).contains(&reg) {
            trace!(reg, value, "bridge register write");
        }

        match reg {
            OV519_R51_RESET1 => {
                if value & RESET1_FIFO != 0 {
                    // Flush the video FIFO: the stream restarts on a frame
                    // boundary.
                    self.frame_offset = 0;
                    self.sequence = 0;
                }
            }
            OV519_R10_H_SIZE => {
                debug!(width = usize::from(value) << 4, "frame width programmed");
            }
            OV519_R11_V_SIZE => {
                debug!(height = usize::from(value) << 3, "frame height programmed");
            }
            R518_I2C_CTL => {
                if value == 0x01 {
                    self.commit_i2c_write();
                } else if self.regs[usize::from(R518_I2C_CTL)] == 0x03 && value == 0x05 {
                    self.commit_i2c_read();
                }
            }
            _ => {}
        }

        self.regs[usize::from(reg)] = value;
    }

    /// Commits the write latched in SADDR_3/DATA to the sensor bus.
    fn commit_i2c_write(&mut self) {
        let reg = self.regs[usize::from(R51X_I2C_SADDR_3)];
        let value = self.regs[usize::from(R51X_I2C_DATA)];
        if reg == SENSOR_COM_A && value & 0x80 != 0 {
            self.sensor_regs[usize::from(reg)] = value & !0x80;
            self.reset_sensor();
            debug!("sensor reset through common-control register");
        } else if let Some(slot) = self.sensor_regs.get_mut(usize::from(reg)) {
            *slot = value;
            trace!(reg, value, "sensor register write");
        } else {
            warn!(reg, "sensor register write out of range");
        }
    }

    /// Commits the read addressed through SADDR_2; the result lands in the
    /// DATA latch.
    fn commit_i2c_read(&mut self) {
        let reg = self.regs[usize::from(R51X_I2C_SADDR_2)];
        let value = match self.sensor_regs.get(usize::from(reg)) {
            Some(&value) => {
                trace!(reg, value, "sensor register read");
                value
            }
            None => {
                warn!(reg, "sensor register read out of range");
                0
            }
        };
        self.regs[usize::from(R51X_I2C_DATA)] = value;
    }

    fn fill_payload(&mut self, offset: usize, out: &mut [u8]) {
        match self.source.as_mut() {
            Some(source) => source.copy_frame(offset, out),
            // Deterministic placeholder pattern derived from the frame
            // offset; stands in for pixel data when nothing is capturing.
            None => out.fill(((offset >> 2) & 0xFF) as u8),
        }
    }

    /// Produces one isochronous video chunk into `buf`.
    ///
    /// Start- and end-of-frame chunks lead with a 16-byte header:
    ///
    /// | byte  | value                                          |
    /// |-------|------------------------------------------------|
    /// | 0..3  | 0xFF 0xFF 0xFF magic                           |
    /// | 3     | 0x50 start of frame, 0x51 end of frame         |
    /// | 9     | 0x01 end-of-frame chunk without image data     |
    /// | 14,15 | in EOF chunks: frame length / 8, little endian |
    ///
    /// Mid-frame chunks are headerless payload. Every chunk carries one
    /// trailing sequence-counter byte after the payload.
    fn video_chunk(&mut self, buf: &mut [u8]) -> usize {
        if buf.len() <= FRAME_HEADER_LEN {
            return 0;
        }
        let frame_len = self.frame_len();
        let len = buf.len();
        let mut sz = (len - 1).min(frame_len.saturating_sub(self.frame_offset));

        self.sequence = self.sequence % 255 + 1;

        if self.frame_offset == 0 {
            write_header(buf, CHUNK_START_OF_FRAME);
            let payload = sz.saturating_sub(FRAME_HEADER_LEN);
            self.fill_payload(0, &mut buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload]);
            self.frame_offset += payload;
            let counter = &mut self.regs[usize::from(OV519_FRAME_COUNTER)];
            *counter = counter.wrapping_add(1);
            self.sequence = 0;
            sz = payload + FRAME_HEADER_LEN;
        } else if self.frame_offset >= frame_len {
            self.frame_offset = 0;
            write_header(buf, CHUNK_END_OF_FRAME);
            buf[9] = 0x01; // no image data in this chunk
            buf[14..16].copy_from_slice(&((frame_len / 8) as u16).to_le_bytes());
            sz = FRAME_HEADER_LEN;
            trace!("end of frame, no payload");
        } else if self.frame_offset + sz >= frame_len && sz + FRAME_HEADER_LEN < len {
            sz = (frame_len - self.frame_offset) + FRAME_HEADER_LEN;
            write_header(buf, CHUNK_END_OF_FRAME);
            buf[14..16].copy_from_slice(&((frame_len / 8) as u16).to_le_bytes());
            let payload = sz - FRAME_HEADER_LEN;
            let offset = self.frame_offset;
            self.fill_payload(offset, &mut buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload]);
            self.frame_offset += payload;
            trace!(offset, payload, "end of frame");
        } else {
            // Mid-frame chunks are raw payload with no header.
            let offset = self.frame_offset;
            self.fill_payload(offset, &mut buf[..sz]);
            self.frame_offset += sz;
        }

        buf[sz] = self.sequence;
        sz + 1
    }
}

fn write_header(buf: &mut [u8], marker: u8) {
    buf[..FRAME_HEADER_LEN].fill(0);
    buf[0] = 0xFF;
    buf[1] = 0xFF;
    buf[2] = 0xFF;
    buf[3] = marker;
}

impl UsbBackend for WebcamBackend {
    fn reset(&mut self) {
        // Bus reset re-runs the sensor power-on sequence; the bridge file
        // (width/height presets included) is left alone.
        self.reset_sensor();
    }

    fn control(&mut self, request: u16, _value: u16, index: u16, data: &mut [u8])
        -> UsbResult<usize> {
        match request {
            VENDOR_REG_READ => {
                let Some(out) = data.first_mut() else {
                    return Err(UsbError::Stall);
                };
                let reg = (index & 0xFF) as u8;
                *out = self.regs[usize::from(reg)];
                trace!(reg, value = *out, "bridge register read");
                Ok(1)
            }
            VENDOR_REG_WRITE => {
                let Some(&value) = data.first() else {
                    return Err(UsbError::Stall);
                };
                self.write_reg((index & 0xFF) as u8, value);
                Ok(1)
            }
            _ => Err(UsbError::Stall),
        }
    }

    fn data(&mut self, token: UsbToken, endpoint: u8, buf: &mut [u8]) -> UsbResult<usize> {
        match token {
            UsbToken::In => match endpoint {
                VIDEO_ENDPOINT => Ok(self.video_chunk(buf)),
                AUDIO_ENDPOINT => {
                    // Microphone placeholder: silence at whatever length the
                    // host asked for.
                    buf.fill(0);
                    Ok(buf.len())
                }
                _ => Ok(0),
            },
            _ => Err(UsbError::Stall),
        }
    }
}
