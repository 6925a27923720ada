//! evdev/uinput event sink
//!
//! Injects synthesized wheel and button events through a uinput virtual
//! device without touching the real mouse.
//!
//! ## Event mapping
//! - pointer-device class: `REL_WHEEL` ±1 for wheel codes, `BTN_SIDE` /
//!   `BTN_EXTRA` press/release for buttons 4 and 5
//! - raw-key class: `MSC_SCAN` carrying the raw code, so raw-code consumers
//!   see the event without a second key press reaching applications
//!
//! ## Qualifiers
//! The modifier snapshot comes from the key state of a keyboard event device
//! (`/dev/input/event*` with letter keys), mapped to the classic qualifier
//! bits. Without a keyboard the qualifier is zero.

use std::path::{Path, PathBuf};

use evdev::uinput::VirtualDevice;
use evdev::{AttributeSet, Device, EventType, InputEvent, KeyCode, LedCode, MiscCode, RelativeAxisCode};

use crate::input::{
    EventClass, EventSink, InputEventDescriptor, SinkError, BUTTON_FIFTH, BUTTON_FOURTH,
    UP_PREFIX, WHEEL_DOWN, WHEEL_UP,
};

/// Qualifier bits
pub mod qualifier {
    pub const LSHIFT: u16 = 0x0001;
    pub const RSHIFT: u16 = 0x0002;
    pub const CAPSLOCK: u16 = 0x0004;
    pub const CONTROL: u16 = 0x0008;
    pub const LALT: u16 = 0x0010;
    pub const RALT: u16 = 0x0020;
    pub const LCOMMAND: u16 = 0x0040;
    pub const RCOMMAND: u16 = 0x0080;
}

/// Modifier keys and the qualifier bit each one sets
const QUALIFIER_KEYS: &[(KeyCode, u16)] = &[
    (KeyCode::KEY_LEFTSHIFT, qualifier::LSHIFT),
    (KeyCode::KEY_RIGHTSHIFT, qualifier::RSHIFT),
    (KeyCode::KEY_LEFTCTRL, qualifier::CONTROL),
    (KeyCode::KEY_RIGHTCTRL, qualifier::CONTROL),
    (KeyCode::KEY_LEFTALT, qualifier::LALT),
    (KeyCode::KEY_RIGHTALT, qualifier::RALT),
    (KeyCode::KEY_LEFTMETA, qualifier::LCOMMAND),
    (KeyCode::KEY_RIGHTMETA, qualifier::RCOMMAND),
];

/// uinput-backed event sink
pub struct UinputSink {
    /// Virtual pointer device; destroyed on drop
    device: VirtualDevice,
    /// Keyboard used for qualifier snapshots
    keyboard: Option<Device>,
}

impl UinputSink {
    /// Create the virtual device and locate a keyboard for qualifiers
    pub fn open(name: &str, keyboard: Option<&Path>) -> Result<Self, SinkError> {
        let mut keys = AttributeSet::<KeyCode>::new();
        keys.insert(KeyCode::BTN_LEFT);
        keys.insert(KeyCode::BTN_SIDE);
        keys.insert(KeyCode::BTN_EXTRA);

        let mut axes = AttributeSet::<RelativeAxisCode>::new();
        axes.insert(RelativeAxisCode::REL_X);
        axes.insert(RelativeAxisCode::REL_Y);
        axes.insert(RelativeAxisCode::REL_WHEEL);

        let mut misc = AttributeSet::<MiscCode>::new();
        misc.insert(MiscCode::MSC_SCAN);

        let device = VirtualDevice::builder()?
            .name(name)
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .with_msc(&misc)?
            .build()?;

        let keyboard = match keyboard {
            Some(path) => match Device::open(path) {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Could not open keyboard: {}", e);
                    None
                }
            },
            None => Self::find_keyboard().and_then(|path| Device::open(path).ok()),
        };

        match &keyboard {
            Some(kbd) => tracing::info!(
                keyboard = kbd.name().unwrap_or("Unknown"),
                "Qualifier snapshots enabled"
            ),
            None => tracing::warn!("No keyboard found - qualifiers will always be empty"),
        }

        tracing::info!(name, "uinput device created");

        Ok(Self { device, keyboard })
    }

    /// Scan /dev/input/ for the first device that looks like a keyboard
    fn find_keyboard() -> Option<PathBuf> {
        let entries = std::fs::read_dir("/dev/input").ok()?;

        for entry in entries.flatten() {
            let path = entry.path();
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            // Only check event devices
            if !filename.starts_with("event") {
                continue;
            }

            match Device::open(&path) {
                Ok(device) => {
                    let is_keyboard = device
                        .supported_keys()
                        .map(|keys| keys.contains(KeyCode::KEY_A) && keys.contains(KeyCode::KEY_LEFTSHIFT))
                        .unwrap_or(false);
                    if is_keyboard {
                        tracing::debug!(
                            path = %path.display(),
                            name = device.name().unwrap_or("Unknown"),
                            "Found keyboard"
                        );
                        return Some(path);
                    }
                }
                Err(e) => {
                    tracing::debug!("Could not check device {:?}: {:?}", path, e);
                }
            }
        }

        None
    }
}

impl EventSink for UinputSink {
    fn inject(&mut self, event: &InputEventDescriptor) -> Result<(), SinkError> {
        let translated = translate(event)?;
        // emit() terminates the batch with SYN_REPORT
        self.device.emit(&[translated])?;
        Ok(())
    }

    fn qualifier(&self) -> u16 {
        let Some(keyboard) = &self.keyboard else {
            return 0;
        };

        let keys = match keyboard.get_key_state() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::trace!("Failed to read key state: {}", e);
                return 0;
            }
        };
        let caps_lock = keyboard
            .get_led_state()
            .map(|leds| leds.contains(LedCode::LED_CAPSL))
            .unwrap_or(false);

        qualifier_from_keys(|key| keys.contains(key), caps_lock)
    }
}

/// Translate a descriptor into the evdev event it is delivered as
pub fn translate(event: &InputEventDescriptor) -> Result<InputEvent, SinkError> {
    match event.class {
        EventClass::RawKeyLike => Ok(InputEvent::new(
            EventType::MISC.0,
            MiscCode::MSC_SCAN.0,
            i32::from(event.code),
        )),
        EventClass::PointerDeviceLike => {
            let value = if event.is_release() { 0 } else { 1 };
            match event.code {
                WHEEL_UP => Ok(InputEvent::new(
                    EventType::RELATIVE.0,
                    RelativeAxisCode::REL_WHEEL.0,
                    1,
                )),
                WHEEL_DOWN => Ok(InputEvent::new(
                    EventType::RELATIVE.0,
                    RelativeAxisCode::REL_WHEEL.0,
                    -1,
                )),
                code if code & !UP_PREFIX == BUTTON_FOURTH => Ok(InputEvent::new(
                    EventType::KEY.0,
                    KeyCode::BTN_SIDE.code(),
                    value,
                )),
                code if code & !UP_PREFIX == BUTTON_FIFTH => Ok(InputEvent::new(
                    EventType::KEY.0,
                    KeyCode::BTN_EXTRA.code(),
                    value,
                )),
                code => Err(SinkError::UnsupportedCode(code)),
            }
        }
    }
}

/// Fold pressed modifier keys into qualifier bits
pub fn qualifier_from_keys(pressed: impl Fn(KeyCode) -> bool, caps_lock: bool) -> u16 {
    let mut bits = QUALIFIER_KEYS
        .iter()
        .filter(|(key, _)| pressed(*key))
        .fold(0, |acc, (_, bit)| acc | bit);
    if caps_lock {
        bits |= qualifier::CAPSLOCK;
    }
    bits
}
