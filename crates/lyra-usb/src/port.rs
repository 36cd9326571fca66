//! Port ownership and controller notifications.
//!
//! A port owns at most one device. The external controller owns the port and
//! is notified of attach/detach and remote-wakeup events through
//! [`PortEvents`]; everything else (reset, suspend, packet dispatch) is the
//! controller calling in.

use tracing::debug;

use crate::device::{AttachedUsbDevice, UsbDeviceState};
use crate::{UsbError, UsbResult, UsbToken};

/// Notifications produced by the port for the external controller.
pub trait PortEvents {
    /// A device was bound to the port.
    fn attach(&mut self, port: usize);

    /// The port's device was removed.
    fn detach(&mut self, port: usize);

    /// The suspended device requested a remote wakeup.
    fn wakeup(&mut self, port: usize);
}

/// A single root port with an optional device bound to it.
pub struct UsbPort {
    index: usize,
    device: Option<AttachedUsbDevice>,
}

impl UsbPort {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            device: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> Option<&AttachedUsbDevice> {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut AttachedUsbDevice> {
        self.device.as_mut()
    }

    /// Binds `device` to the port. An already-attached device is detached
    /// first. The device stays unresponsive until the controller resets the
    /// port.
    pub fn attach(&mut self, mut device: AttachedUsbDevice, events: &mut dyn PortEvents) {
        if self.device.is_some() {
            self.detach(events);
        }
        device.set_attached();
        self.device = Some(device);
        debug!(port = self.index, "device attached");
        events.attach(self.index);
    }

    /// Removes and tears down the device, if any. Safe to call on an empty
    /// port.
    pub fn detach(&mut self, events: &mut dyn PortEvents) {
        if let Some(mut device) = self.device.take() {
            device.backend_detach();
            debug!(port = self.index, "device detached");
            events.detach(self.index);
        }
    }

    /// Drives a bus reset down the port.
    pub fn reset(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.reset();
        }
    }

    pub fn suspend(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.suspend();
        }
    }

    pub fn resume(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.resume();
        }
    }

    /// Remote wakeup: resumes the device and notifies the controller, but
    /// only if the device is suspended and the host enabled the feature.
    pub fn wakeup(&mut self, events: &mut dyn PortEvents) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if device.state() == UsbDeviceState::Suspended && device.remote_wakeup_enabled() {
            device.resume();
            events.wakeup(self.index);
        }
    }

    /// Forwards one transaction to the attached device.
    pub fn dispatch(
        &mut self,
        token: UsbToken,
        devaddr: u8,
        devep: u8,
        buf: &mut [u8],
    ) -> UsbResult<usize> {
        match self.device.as_mut() {
            Some(device) => device.dispatch(token, devaddr, devep, buf),
            None => Err(UsbError::NoDevice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DescriptorSet, UsbBackend};
    use crate::{UsbSpeed, FEATURE_DEVICE_REMOTE_WAKEUP, REQ_SET_FEATURE};

    static DEVICE_DESCRIPTOR: [u8; 18] = [
        0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x34, 0x12, 0x01, 0x00, 0x00, 0x01,
        0x00, 0x00, 0x00, 0x01,
    ];
    static CONFIG_DESCRIPTOR: [u8; 9] = [0x09, 0x02, 0x09, 0x00, 0x01, 0x01, 0x00, 0xA0, 0x32];

    struct NullBackend;

    impl UsbBackend for NullBackend {
        fn reset(&mut self) {}

        fn control(
            &mut self,
            _request: u16,
            _value: u16,
            _index: u16,
            _data: &mut [u8],
        ) -> UsbResult<usize> {
            Err(UsbError::Stall)
        }

        fn data(&mut self, _token: UsbToken, _ep: u8, _buf: &mut [u8]) -> UsbResult<usize> {
            Err(UsbError::Stall)
        }
    }

    #[derive(Default)]
    struct EventLog {
        attaches: Vec<usize>,
        detaches: Vec<usize>,
        wakeups: Vec<usize>,
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

    fn null_device() -> AttachedUsbDevice {
        let descriptors = DescriptorSet {
            device: &DEVICE_DESCRIPTOR,
            configuration: &CONFIG_DESCRIPTOR,
            strings: &[],
            num_interfaces: 1,
        };
        AttachedUsbDevice::new(descriptors, Box::new(NullBackend), UsbSpeed::Full)
    }

    fn enable_remote_wakeup(port: &mut UsbPort) {
        let mut setup = [
            0x00,
            REQ_SET_FEATURE,
            FEATURE_DEVICE_REMOTE_WAKEUP as u8,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        port.dispatch(UsbToken::Setup, 0, 0, &mut setup).unwrap();
        port.dispatch(UsbToken::In, 0, 0, &mut []).unwrap();
    }

    #[test]
    fn empty_port_reports_no_device() {
        let mut port = UsbPort::new(0);
        let mut buf = [0u8; 8];
        assert_eq!(
            port.dispatch(UsbToken::In, 0, 1, &mut buf),
            Err(UsbError::NoDevice)
        );
    }

    #[test]
    fn attach_notifies_and_gates_on_reset() {
        let mut port = UsbPort::new(1);
        let mut events = EventLog::default();
        port.attach(null_device(), &mut events);
        assert_eq!(events.attaches, vec![1]);

        // Unreset device does not answer.
        let mut buf = [0u8; 8];
        assert_eq!(
            port.dispatch(UsbToken::In, 0, 1, &mut buf),
            Err(UsbError::NoDevice)
        );

        port.reset();
        assert_eq!(
            port.device().map(|d| d.state()),
            Some(UsbDeviceState::Default)
        );
    }

    #[test]
    fn attach_over_existing_device_detaches_first() {
        let mut port = UsbPort::new(0);
        let mut events = EventLog::default();
        port.attach(null_device(), &mut events);
        port.attach(null_device(), &mut events);
        assert_eq!(events.attaches, vec![0, 0]);
        assert_eq!(events.detaches, vec![0]);
    }

    #[test]
    fn detach_is_idempotent() {
        let mut port = UsbPort::new(0);
        let mut events = EventLog::default();
        port.attach(null_device(), &mut events);
        port.detach(&mut events);
        port.detach(&mut events);
        assert_eq!(events.detaches, vec![0]);
        assert!(port.device().is_none());
    }

    #[test]
    fn wakeup_requires_suspend_and_enabled_feature() {
        let mut port = UsbPort::new(2);
        let mut events = EventLog::default();
        port.attach(null_device(), &mut events);
        port.reset();

        // Not suspended: no event.
        port.wakeup(&mut events);
        assert!(events.wakeups.is_empty());

        // Suspended but remote wakeup disabled: no event.
        port.suspend();
        port.wakeup(&mut events);
        assert!(events.wakeups.is_empty());
        port.resume();

        enable_remote_wakeup(&mut port);
        port.suspend();
        assert_eq!(
            port.device().map(|d| d.state()),
            Some(UsbDeviceState::Suspended)
        );
        port.wakeup(&mut events);
        assert_eq!(events.wakeups, vec![2]);
        assert_eq!(
            port.device().map(|d| d.state()),
            Some(UsbDeviceState::Default)
        );
    }
}
