//! Status words, BOP bits and device classification
//!
//! Every peer publishes a 32-bit state word. The low 12 bits carry
//! device-class specific flags, the upper bits are shared: error bits,
//! the Block-Of-Processing (BOP) mask, stop and weather flags.

use serde::{Deserialize, Serialize};

/// Raw state word as carried on the wire.
pub type StatusWord = u32;

// ==================== Shared Bits ====================

pub const DEVICE_ERROR_MASK: StatusWord = 0x000f_0000;
pub const DEVICE_NO_ERROR: StatusWord = 0x0000_0000;
pub const DEVICE_ERROR_KILL: StatusWord = 0x0001_0000;
pub const DEVICE_ERROR_HW: StatusWord = 0x0002_0000;
pub const DEVICE_NOT_READY: StatusWord = 0x0004_0000;

pub const BOP_MASK: StatusWord = 0x3f00_0000;
pub const BOP_EXPOSURE: StatusWord = 0x0100_0000;
pub const BOP_READOUT: StatusWord = 0x0200_0000;
pub const BOP_TEL_MOVE: StatusWord = 0x0400_0000;
pub const BOP_WILL_EXPOSE: StatusWord = 0x0800_0000;
pub const BOP_TRIG_EXPOSE: StatusWord = 0x1000_0000;

pub const STOP_MASK: StatusWord = 0x4000_0000;
pub const CAN_MOVE: StatusWord = 0x0000_0000;
pub const STOP_EVERYTHING: StatusWord = 0x4000_0000;

pub const WEATHER_MASK: StatusWord = 0x8000_0000;
pub const GOOD_WEATHER: StatusWord = 0x0000_0000;
pub const BAD_WEATHER: StatusWord = 0x8000_0000;

pub const WR_MASK: StatusWord = 0x00f0_0000;

pub const DEVICE_STATUS_MASK: StatusWord = 0x0000_0fff;
pub const DEVICE_IDLE: StatusWord = 0x0000_0000;

pub const DEVICE_MISC_MASK: StatusWord = 0x0000_f000;
/// The state change was caused by the connection receiving it.
pub const DEVICE_SC_CURR: StatusWord = 0x0000_1000;
pub const DEVICE_NEED_RELOAD: StatusWord = 0x0000_2000;
pub const DEVICE_STARTUP: StatusWord = 0x0000_4000;

// ==================== Central Server ====================

pub const SERVERD_STATUS_MASK: StatusWord = 0x00f;
pub const SERVERD_DAY: StatusWord = 0x000;
pub const SERVERD_EVENING: StatusWord = 0x001;
pub const SERVERD_DUSK: StatusWord = 0x002;
pub const SERVERD_NIGHT: StatusWord = 0x003;
pub const SERVERD_DAWN: StatusWord = 0x004;
pub const SERVERD_MORNING: StatusWord = 0x005;
pub const SERVERD_UNKNOWN: StatusWord = 13;

pub const SERVERD_ONOFF_MASK: StatusWord = 0x030;
pub const SERVERD_ON: StatusWord = 0x000;
pub const SERVERD_STANDBY: StatusWord = 0x010;
pub const SERVERD_SOFT_OFF: StatusWord = 0x020;
pub const SERVERD_HARD_OFF: StatusWord = 0x030;

// ==================== Device Classes ====================

pub const CAM_MASK_EXPOSE: StatusWord = 0x011;
pub const CAM_NOEXPOSURE: StatusWord = 0x000;
pub const CAM_EXPOSING: StatusWord = 0x001;
pub const CAM_EXPOSING_NOIM: StatusWord = 0x010;
pub const CAM_MASK_READING: StatusWord = 0x002;
pub const CAM_NOTREADING: StatusWord = 0x000;
pub const CAM_READING: StatusWord = 0x002;
pub const CAM_MASK_FT: StatusWord = 0x004;
pub const CAM_FT: StatusWord = 0x004;
pub const CAM_NOFT: StatusWord = 0x000;

pub const PHOT_MASK_INTEGRATE: StatusWord = 0x001;
pub const PHOT_NOINTEGRATE: StatusWord = 0x000;
pub const PHOT_INTEGRATE: StatusWord = 0x001;
pub const PHOT_MASK_FILTER: StatusWord = 0x002;
pub const PHOT_FILTER_IDLE: StatusWord = 0x000;
pub const PHOT_FILTER_MOVE: StatusWord = 0x002;

pub const FOC_MASK_FOCUSING: StatusWord = 0x001;
pub const FOC_SLEEPING: StatusWord = 0x000;
pub const FOC_FOCUSING: StatusWord = 0x001;

pub const TEL_MASK_CUP_MOVING: StatusWord = 0x00f;
pub const TEL_OBSERVING: StatusWord = 0x000;
pub const TEL_MOVING: StatusWord = 0x001;
pub const TEL_PARKED: StatusWord = 0x002;
pub const TEL_PARKING: StatusWord = 0x004;
pub const TEL_WAIT_CUP: StatusWord = 0x008;
pub const TEL_CORRECTING: StatusWord = 0x040;

pub const DOME_CUP_MASK_SYNC: StatusWord = 0x080;
pub const DOME_CUP_NOT_SYNC: StatusWord = 0x000;
pub const DOME_CUP_SYNC: StatusWord = 0x080;

pub const MIRROR_MASK: StatusWord = 0x01f;
pub const MIRROR_UNKNOWN: StatusWord = 0x000;
pub const MIRROR_A: StatusWord = 0x001;
pub const MIRROR_A_B: StatusWord = 0x002;
pub const MIRROR_B: StatusWord = 0x003;
pub const MIRROR_B_A: StatusWord = 0x004;

pub const FILTERD_MASK: StatusWord = 0x002;
pub const FILTERD_IDLE: StatusWord = 0x000;
pub const FILTERD_MOVE: StatusWord = 0x002;

pub const EXEC_STATE_MASK: StatusWord = 0x00f;
pub const EXEC_IDLE: StatusWord = 0x000;
pub const EXEC_LASTREAD: StatusWord = 0x005;

// ==================== Command Return Codes ====================

pub const DEVDEM_OK: i32 = 0;
pub const DEVDEM_E_COMMAND: i32 = -1;
pub const DEVDEM_E_PARAMSNUM: i32 = -2;
pub const DEVDEM_E_PARAMSVAL: i32 = -3;
pub const DEVDEM_E_HW: i32 = -4;
pub const DEVDEM_E_SYSTEM: i32 = -5;
pub const DEVDEM_E_PRIORITY: i32 = -6;
pub const DEVDEM_E_TIMEOUT: i32 = -7;
pub const DEVDEM_E_IGNORE: i32 = -8;

/// Device classification announced by the broker in `device` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Unknown,
    Serverd,
    Mount,
    Ccd,
    Dome,
    Weather,
    Rotator,
    Phot,
    Plan,
    Grb,
    Focus,
    Mirror,
    Cupola,
    FilterWheel,
    AugerShooter,
    Sensor,
    Executor,
    Imgproc,
    Selector,
    Xmlrpc,
    Indi,
    Logd,
    Scriptor,
    Bb,
}

impl DeviceType {
    /// Map a wire code onto a device type; unknown codes map to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Serverd,
            2 => Self::Mount,
            3 => Self::Ccd,
            4 => Self::Dome,
            5 => Self::Weather,
            6 => Self::Rotator,
            7 => Self::Phot,
            8 => Self::Plan,
            9 => Self::Grb,
            10 => Self::Focus,
            11 => Self::Mirror,
            12 => Self::Cupola,
            13 => Self::FilterWheel,
            14 => Self::AugerShooter,
            15 => Self::Sensor,
            20 => Self::Executor,
            21 => Self::Imgproc,
            22 => Self::Selector,
            23 => Self::Xmlrpc,
            24 => Self::Indi,
            25 => Self::Logd,
            26 => Self::Scriptor,
            27 => Self::Bb,
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Serverd => 1,
            Self::Mount => 2,
            Self::Ccd => 3,
            Self::Dome => 4,
            Self::Weather => 5,
            Self::Rotator => 6,
            Self::Phot => 7,
            Self::Plan => 8,
            Self::Grb => 9,
            Self::Focus => 10,
            Self::Mirror => 11,
            Self::Cupola => 12,
            Self::FilterWheel => 13,
            Self::AugerShooter => 14,
            Self::Sensor => 15,
            Self::Executor => 20,
            Self::Imgproc => 21,
            Self::Selector => 22,
            Self::Xmlrpc => 23,
            Self::Indi => 24,
            Self::Logd => 25,
            Self::Scriptor => 26,
            Self::Bb => 27,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Serverd => "serverd",
            Self::Mount => "mount",
            Self::Ccd => "ccd",
            Self::Dome => "dome",
            Self::Weather => "weather",
            Self::Rotator => "rotator",
            Self::Phot => "phot",
            Self::Plan => "plan",
            Self::Grb => "grb",
            Self::Focus => "focus",
            Self::Mirror => "mirror",
            Self::Cupola => "cupola",
            Self::FilterWheel => "filterwheel",
            Self::AugerShooter => "augershooter",
            Self::Sensor => "sensor",
            Self::Executor => "executor",
            Self::Imgproc => "imgproc",
            Self::Selector => "selector",
            Self::Xmlrpc => "xmlrpc",
            Self::Indi => "indi",
            Self::Logd => "logd",
            Self::Scriptor => "scriptor",
            Self::Bb => "bb",
        };
        f.write_str(name)
    }
}

/// A state word together with the value it replaced.
///
/// Device-class adapters compare sub-fields of the current and previous
/// word to decide which transition happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerState {
    value: StatusWord,
    old_value: StatusWord,
}

impl ServerState {
    pub fn new(value: StatusWord) -> Self {
        Self {
            value,
            old_value: value,
        }
    }

    pub fn set_value(&mut self, value: StatusWord) {
        self.old_value = self.value;
        self.value = value;
    }

    pub fn value(&self) -> StatusWord {
        self.value
    }

    pub fn old_value(&self) -> StatusWord {
        self.old_value
    }

    /// Did any bit under `mask` change with the last update?
    pub fn mask_changed(&self, mask: StatusWord) -> bool {
        (self.old_value & mask) != (self.value & mask)
    }

    pub fn error_state(&self) -> StatusWord {
        self.value & DEVICE_ERROR_MASK
    }
}

/// Human readable rendering of a central-server state word.
pub fn master_state_string(state: StatusWord) -> String {
    let mut out = match state & SERVERD_ONOFF_MASK {
        SERVERD_HARD_OFF => String::from("HARD OFF"),
        SERVERD_SOFT_OFF => String::from("SOFT OFF"),
        SERVERD_STANDBY => String::from("STANDBY "),
        _ => String::from("ON "),
    };
    if state & SERVERD_ONOFF_MASK != SERVERD_HARD_OFF && state & SERVERD_ONOFF_MASK != SERVERD_SOFT_OFF {
        let period = match state & SERVERD_STATUS_MASK {
            SERVERD_DAY => "day",
            SERVERD_EVENING => "evening",
            SERVERD_DUSK => "dusk",
            SERVERD_NIGHT => "night",
            SERVERD_DAWN => "dawn",
            SERVERD_MORNING => "morning",
            _ => "unknown",
        };
        out.push_str(period);
    }
    if state & WEATHER_MASK == BAD_WEATHER {
        out.push_str(" | BAD WEATHER");
    }
    if state & STOP_MASK == STOP_EVERYTHING {
        out.push_str(" | STOP");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== DeviceType Tests ====================

    #[test]
    fn test_device_type_codes_are_stable() {
        for code in (0..=15).chain(20..=27) {
            assert_eq!(DeviceType::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_device_type_gap_maps_to_unknown() {
        assert_eq!(DeviceType::from_code(17), DeviceType::Unknown);
        assert_eq!(DeviceType::from_code(-3), DeviceType::Unknown);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(DeviceType::Ccd.to_string(), "ccd");
        assert_eq!(DeviceType::FilterWheel.to_string(), "filterwheel");
    }

    // ==================== ServerState Tests ====================

    #[test]
    fn test_server_state_mask_changed() {
        let mut state = ServerState::new(0);
        state.set_value(CAM_EXPOSING);
        assert!(state.mask_changed(CAM_MASK_EXPOSE));
        assert!(!state.mask_changed(CAM_MASK_READING));

        state.set_value(CAM_EXPOSING | CAM_READING);
        assert!(!state.mask_changed(CAM_MASK_EXPOSE));
        assert!(state.mask_changed(CAM_MASK_READING));
    }

    #[test]
    fn test_server_state_error_bits() {
        let state = ServerState::new(DEVICE_ERROR_HW | TEL_MOVING);
        assert_eq!(state.error_state(), DEVICE_ERROR_HW);
    }

    #[test]
    fn test_master_state_string() {
        assert_eq!(master_state_string(SERVERD_HARD_OFF), "HARD OFF");
        assert_eq!(master_state_string(SERVERD_NIGHT), "ON night");
        assert_eq!(
            master_state_string(SERVERD_STANDBY | SERVERD_DUSK | BAD_WEATHER),
            "STANDBY dusk | BAD WEATHER"
        );
    }
}
