//! Line tags, value flags and operator messages

use serde::{Deserialize, Serialize};

use crate::params::{ParamResult, Params};

// ==================== Line Tags ====================

/// Variable value update: `V <name> <value>`
pub const PROTO_VALUE: &str = "V";
/// Set-variable request: `X <name> <op> <value>`
pub const PROTO_SET_VALUE: &str = "X";
/// Authorization request/response: `A <what> <id>`
pub const PROTO_AUTH: &str = "A";
/// Device state word: `S <state> ["msg"]`
pub const PROTO_STATUS: &str = "S";
/// Progress window: `P <start> <end>`
pub const PROTO_PROGRESS: &str = "P";
/// State word with progress: `R <state> <start> <end> ["msg"]`
pub const PROTO_STATUS_PROGRESS: &str = "R";
/// BOP state: `B <state> <bop>`
pub const PROTO_BOP_STATE: &str = "B";
/// Keepalive: `T ready` / `T OK`
pub const PROTO_TECHNICAL: &str = "T";
/// Operator message: `M <sec> <usec> <origin> <type> <text>`
pub const PROTO_MESSAGE: &str = "M";
/// Value metadata: `E <flags> "<name>" "<description>"`
pub const PROTO_METAINFO: &str = "E";
/// Selection list entry: `F <name> <entry>`; `F <name>` clears the list
pub const PROTO_SELMETAINFO: &str = "F";
/// Binary channel open: `C <conn> <data type> <channels> <size>...`
pub const PROTO_BINARY: &str = "C";
/// Binary chunk header: `D <conn> <channel> <size>`, followed by raw bytes
pub const PROTO_DATA: &str = "D";
/// Binary transfer killed: `H <conn>`
pub const PROTO_BINARY_KILLED: &str = "H";
/// Shared segment announce: `I <conn> <segment> <channels> ...`
pub const PROTO_SHARED: &str = "I";
/// Shared segment complete: `J <conn>`
pub const PROTO_SHARED_FULL: &str = "J";
/// Shared segment killed: `K <conn>`
pub const PROTO_SHARED_KILLED: &str = "K";

pub const COMMAND_INFO: &str = "info";
pub const COMMAND_STATUS_INFO: &str = "status_info";
pub const COMMAND_DEVICE_STATUS: &str = "device_status";
pub const COMMAND_DATA_IN_FITS: &str = "fits_data";
pub const COMMAND_CCD_EXPOSURE: &str = "expose";
pub const COMMAND_TELD_MOVE: &str = "move";

// ==================== Value Flags ====================

pub const VALUE_STRING: i32 = 0x0000_0001;
pub const VALUE_INTEGER: i32 = 0x0000_0002;
pub const VALUE_TIME: i32 = 0x0000_0003;
pub const VALUE_DOUBLE: i32 = 0x0000_0004;
pub const VALUE_FLOAT: i32 = 0x0000_0005;
pub const VALUE_BOOL: i32 = 0x0000_0006;
pub const VALUE_SELECTION: i32 = 0x0000_0007;
pub const VALUE_LONGINT: i32 = 0x0000_0008;
pub const VALUE_RADEC: i32 = 0x0000_0009;
pub const VALUE_ALTAZ: i32 = 0x0000_000a;
pub const VALUE_BASE_TYPE: i32 = 0x0000_000f;
pub const VALUE_EXT_TYPE: i32 = 0x0000_0070;
/// Base and extended type bits together
pub const VALUE_MASK: i32 = 0x0000_007f;

// extended types
pub const VALUE_STAT: i32 = 0x0000_0010;
pub const VALUE_MMAX: i32 = 0x0000_0020;
pub const VALUE_RECTANGLE: i32 = 0x0000_0030;
pub const VALUE_ARRAY: i32 = 0x0000_0040;
pub const VALUE_TIMESERIE: i32 = 0x0000_0070;

pub const VALUE_FITS: i32 = 0x0000_0100;
pub const VALUE_WRITABLE: i32 = 0x0200_0000;

pub const VALUE_ERRORMASK: i32 = 0x3000_0000;
pub const VALUE_GOOD: i32 = 0x0000_0000;
pub const VALUE_WARNING: i32 = 0x1000_0000;
pub const VALUE_ERROR: i32 = 0x2000_0000;

// ==================== Command Returns ====================

/// True when the line is a command return (`+0 OK`, `-4 failed`, `1 queued`).
pub fn is_command_return(line: &str) -> bool {
    matches!(line.trim_start().chars().next(), Some('+' | '-' | '0'..='9'))
}

/// Parse the status code of a command return line.
pub fn parse_command_return(line: &str) -> Option<i32> {
    let (code, _) = Params::split_command(line);
    code.parse().ok()
}

/// Format a command return; zero renders as `+0`, other codes carry their sign.
pub fn command_end(code: i32, text: &str) -> String {
    format!("{:+} {}", code, text)
}

// ==================== Operator Messages ====================

pub const MESSAGE_ERROR: i32 = 0x01;
pub const MESSAGE_WARNING: i32 = 0x02;
pub const MESSAGE_INFO: i32 = 0x04;
pub const MESSAGE_DEBUG: i32 = 0x08;

/// Operator message relayed between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sec: i64,
    pub usec: i64,
    pub origin: String,
    pub kind: i32,
    pub text: String,
}

impl Message {
    pub fn new(sec: i64, usec: i64, origin: impl Into<String>, kind: i32, text: impl Into<String>) -> Self {
        Self {
            sec,
            usec,
            origin: origin.into(),
            kind,
            text: text.into(),
        }
    }

    /// Parse the parameters following the `M` tag.
    pub fn parse(params: &mut Params<'_>) -> ParamResult<Self> {
        let (sec, usec) = params.next_timeval()?;
        let origin = params.next_string()?.to_string();
        let kind = params.next_i32()?;
        let text = params.rest().to_string();
        Ok(Self {
            sec,
            usec,
            origin,
            kind,
            text,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            PROTO_MESSAGE, self.sec, self.usec, self.origin, self.kind, self.text
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind & MESSAGE_ERROR != 0
    }
}
