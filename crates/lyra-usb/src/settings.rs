//! Read-only view of the external per-port settings store.
//!
//! Settings are identified by a `(device kind, port number)` pair plus a
//! field name and resolve to string, integer or boolean values. How they are
//! persisted is the host application's business; the core only ever reads
//! resolved values.

use std::collections::HashMap;

/// Identifies the settings section for one emulated device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DeviceKey<'a> {
    pub kind: &'a str,
    pub port: u8,
}

impl<'a> DeviceKey<'a> {
    pub fn new(kind: &'a str, port: u8) -> Self {
        Self { kind, port }
    }
}

pub trait SettingsStore {
    fn get_str(&self, key: DeviceKey<'_>, name: &str) -> Option<String>;
    fn get_i32(&self, key: DeviceKey<'_>, name: &str) -> Option<i32>;
    fn get_bool(&self, key: DeviceKey<'_>, name: &str) -> Option<bool>;
}

/// Store with no entries; every lookup falls back to the caller's default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSettings;

impl SettingsStore for NullSettings {
    fn get_str(&self, _key: DeviceKey<'_>, _name: &str) -> Option<String> {
        None
    }

    fn get_i32(&self, _key: DeviceKey<'_>, _name: &str) -> Option<i32> {
        None
    }

    fn get_bool(&self, _key: DeviceKey<'_>, _name: &str) -> Option<bool> {
        None
    }
}

/// In-memory store for tests and embedders without persistent configuration.
#[derive(Clone, Debug, Default)]
pub struct MemSettings {
    strings: HashMap<(String, u8, String), String>,
    ints: HashMap<(String, u8, String), i32>,
    bools: HashMap<(String, u8, String), bool>,
}

impl MemSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_str(&mut self, key: DeviceKey<'_>, name: &str, value: &str) {
        self.strings
            .insert(owned_key(key, name), value.to_owned());
    }

    pub fn put_i32(&mut self, key: DeviceKey<'_>, name: &str, value: i32) {
        self.ints.insert(owned_key(key, name), value);
    }

    pub fn put_bool(&mut self, key: DeviceKey<'_>, name: &str, value: bool) {
        self.bools.insert(owned_key(key, name), value);
    }
}

fn owned_key(key: DeviceKey<'_>, name: &str) -> (String, u8, String) {
    (key.kind.to_owned(), key.port, name.to_owned())
}

impl SettingsStore for MemSettings {
    fn get_str(&self, key: DeviceKey<'_>, name: &str) -> Option<String> {
        self.strings.get(&owned_key(key, name)).cloned()
    }

    fn get_i32(&self, key: DeviceKey<'_>, name: &str) -> Option<i32> {
        self.ints.get(&owned_key(key, name)).copied()
    }

    fn get_bool(&self, key: DeviceKey<'_>, name: &str) -> Option<bool> {
        self.bools.get(&owned_key(key, name)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_scoped_by_kind_and_port() {
        let mut settings = MemSettings::new();
        settings.put_i32(DeviceKey::new("pad", 0), "button0", 3);
        settings.put_bool(DeviceKey::new("pad", 0), "reverse_x", true);
        settings.put_str(DeviceKey::new("pad", 1), "api", "joydev");

        assert_eq!(
            settings.get_i32(DeviceKey::new("pad", 0), "button0"),
            Some(3)
        );
        assert_eq!(settings.get_i32(DeviceKey::new("pad", 1), "button0"), None);
        assert_eq!(
            settings.get_bool(DeviceKey::new("pad", 0), "reverse_x"),
            Some(true)
        );
        assert_eq!(
            settings.get_str(DeviceKey::new("pad", 1), "api").as_deref(),
            Some("joydev")
        );
        assert_eq!(settings.get_str(DeviceKey::new("cam", 1), "api"), None);
    }

    #[test]
    fn null_settings_always_miss() {
        let settings = NullSettings;
        assert_eq!(settings.get_i32(DeviceKey::new("pad", 0), "button0"), None);
        assert_eq!(settings.get_bool(DeviceKey::new("pad", 0), "x"), None);
    }
}
