//! Named value table
//!
//! Devices publish typed values: `E` lines announce type, name and
//! description, `V` lines carry updates and `F` lines fill selection lists.
//! The same table backs the block's own published values.

use std::fmt;

use observa_protocol::messages::{
    VALUE_ALTAZ, VALUE_ARRAY, VALUE_BASE_TYPE, VALUE_BOOL, VALUE_DOUBLE, VALUE_ERROR,
    VALUE_ERRORMASK, VALUE_EXT_TYPE, VALUE_FLOAT, VALUE_GOOD, VALUE_INTEGER, VALUE_LONGINT,
    VALUE_MASK, VALUE_MMAX, VALUE_RADEC, VALUE_RECTANGLE, VALUE_SELECTION, VALUE_STAT,
    VALUE_STRING, VALUE_TIME, VALUE_TIMESERIE, VALUE_WARNING,
};
use observa_protocol::{ParamError, ParamResult, Params};

/// Statistics over a series of measurements
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    pub value: f64,
    pub count: i32,
    pub mode: f64,
    pub min: f64,
    pub max: f64,
    pub stdev: f64,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            value: f64::NAN,
            count: 0,
            mode: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            stdev: f64::NAN,
        }
    }
}

impl Stat {
    fn parse(params: &mut Params<'_>) -> ParamResult<Self> {
        Ok(Self {
            value: params.next_f64()?,
            count: params.next_i32()?,
            mode: params.next_f64()?,
            min: params.next_f64()?,
            max: params.next_f64()?,
            stdev: params.next_f64()?,
        })
    }
}

/// Current content of a value
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    String(String),
    Integer(i32),
    Time(f64),
    Double(f64),
    Float(f32),
    Bool(bool),
    Selection { index: i32, entries: Vec<String> },
    LongInt(i64),
    RaDec { ra: f64, dec: f64 },
    AltAz { alt: f64, az: f64 },
    Stat(Stat),
    MinMax { value: f64, min: f64, max: f64 },
    Rectangle { x: i32, y: i32, w: i32, h: i32 },
    /// Statistics plus the linear trend `alpha + beta * t`
    Timeserie { stat: Stat, alpha: f64, beta: f64 },
    StringArray(Vec<String>),
    DoubleArray(Vec<f64>),
    TimeArray(Vec<f64>),
    IntegerArray(Vec<i32>),
    BoolArray(Vec<bool>),
}

impl ValueData {
    /// Empty content for the type bits of `flags`; `None` for types this
    /// table does not hold.
    fn for_type(flags: i32) -> Option<Self> {
        let data = match flags & VALUE_EXT_TYPE {
            0 => return Self::for_base_type(flags),
            VALUE_STAT => Self::Stat(Stat::default()),
            VALUE_MMAX => Self::MinMax {
                value: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            },
            VALUE_RECTANGLE => Self::Rectangle { x: 0, y: 0, w: 0, h: 0 },
            VALUE_TIMESERIE => Self::Timeserie {
                stat: Stat::default(),
                alpha: f64::NAN,
                beta: f64::NAN,
            },
            VALUE_ARRAY => match flags & VALUE_BASE_TYPE {
                VALUE_STRING => Self::StringArray(Vec::new()),
                VALUE_DOUBLE => Self::DoubleArray(Vec::new()),
                VALUE_TIME => Self::TimeArray(Vec::new()),
                VALUE_INTEGER => Self::IntegerArray(Vec::new()),
                VALUE_BOOL => Self::BoolArray(Vec::new()),
                _ => return None,
            },
            _ => return None,
        };
        Some(data)
    }

    fn for_base_type(flags: i32) -> Option<Self> {
        let data = match flags & VALUE_BASE_TYPE {
            VALUE_STRING => Self::String(String::new()),
            VALUE_INTEGER => Self::Integer(0),
            VALUE_TIME => Self::Time(f64::NAN),
            VALUE_DOUBLE => Self::Double(f64::NAN),
            VALUE_FLOAT => Self::Float(f32::NAN),
            VALUE_BOOL => Self::Bool(false),
            VALUE_SELECTION => Self::Selection {
                index: 0,
                entries: Vec::new(),
            },
            VALUE_LONGINT => Self::LongInt(0),
            VALUE_RADEC => Self::RaDec {
                ra: f64::NAN,
                dec: f64::NAN,
            },
            VALUE_ALTAZ => Self::AltAz {
                alt: f64::NAN,
                az: f64::NAN,
            },
            _ => return None,
        };
        Some(data)
    }
}

/// Read tokens until the line ends.
fn parse_list<'a, T>(
    params: &mut Params<'a>,
    mut next: impl FnMut(&mut Params<'a>) -> ParamResult<T>,
) -> ParamResult<Vec<T>> {
    let mut out = Vec::new();
    while !params.is_end() {
        out.push(next(params)?);
    }
    Ok(out)
}

fn parse_bool(token: &str) -> ParamResult<bool> {
    match token {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        _ => Err(ParamError::Invalid {
            expected: "bool",
            token: token.to_string(),
        }),
    }
}

/// One named value
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    name: String,
    description: String,
    flags: i32,
    data: ValueData,
}

impl Value {
    /// Create an empty value of the type encoded in `flags`.
    pub fn new(name: impl Into<String>, description: impl Into<String>, flags: i32) -> Option<Self> {
        Some(Self {
            name: name.into(),
            description: description.into(),
            flags,
            data: ValueData::for_type(flags)?,
        })
    }

    pub fn with_data(mut self, data: ValueData) -> Self {
        self.data = data;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Base and extended type bits
    pub fn value_type(&self) -> i32 {
        self.flags & VALUE_MASK
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn set_data(&mut self, data: ValueData) {
        self.data = data;
    }

    fn set_meta(&mut self, flags: i32, description: &str) {
        self.flags = flags;
        self.description = description.to_string();
    }

    pub fn error_mask(&self) -> i32 {
        self.flags & VALUE_ERRORMASK
    }

    /// Replace the error bits. Returns true when they changed.
    pub fn set_error_mask(&mut self, mask: i32) -> bool {
        let mask = mask & VALUE_ERRORMASK;
        if self.error_mask() == mask {
            return false;
        }
        self.flags = (self.flags & !VALUE_ERRORMASK) | mask;
        true
    }

    pub fn is_good(&self) -> bool {
        self.error_mask() == VALUE_GOOD
    }

    pub fn is_warning(&self) -> bool {
        self.error_mask() == VALUE_WARNING
    }

    pub fn is_error(&self) -> bool {
        self.error_mask() == VALUE_ERROR
    }

    /// Parse the payload of a `V <name> ...` line.
    pub fn set_from_params(&mut self, params: &mut Params<'_>, now: f64) -> ParamResult<()> {
        match &mut self.data {
            ValueData::Stat(stat) => *stat = Stat::parse(params)?,
            ValueData::MinMax { value, min, max } => {
                *value = params.next_f64()?;
                *min = params.next_f64()?;
                *max = params.next_f64()?;
            }
            ValueData::Rectangle { x, y, w, h } => {
                *x = params.next_i32()?;
                *y = params.next_i32()?;
                *w = params.next_i32()?;
                *h = params.next_i32()?;
            }
            ValueData::Timeserie { stat, alpha, beta } => {
                *stat = Stat::parse(params)?;
                *alpha = params.next_f64()?;
                *beta = params.next_f64()?;
            }
            ValueData::StringArray(v) => {
                *v = parse_list(params, |p| p.next_string().map(str::to_string))?;
            }
            ValueData::DoubleArray(v) => {
                params.unquote_rest();
                *v = parse_list(params, Params::next_f64)?;
            }
            ValueData::TimeArray(v) => {
                params.unquote_rest();
                *v = parse_list(params, |p| p.next_time(now))?;
            }
            ValueData::IntegerArray(v) => {
                params.unquote_rest();
                *v = parse_list(params, Params::next_i32)?;
            }
            ValueData::BoolArray(v) => {
                params.unquote_rest();
                *v = parse_list(params, |p| p.next_string().and_then(parse_bool))?;
            }
            ValueData::String(s) => *s = params.next_string()?.to_string(),
            ValueData::Integer(v) => *v = params.next_i32()?,
            ValueData::Time(v) => *v = params.next_time(now)?,
            ValueData::Double(v) => *v = params.next_f64()?,
            ValueData::Float(v) => *v = params.next_f64()? as f32,
            ValueData::Bool(v) => *v = parse_bool(params.next_string()?)?,
            ValueData::Selection { index, .. } => *index = params.next_i32()?,
            ValueData::LongInt(v) => *v = params.next_i64()?,
            ValueData::RaDec { ra, dec } => {
                *ra = params.next_f64()?;
                *dec = params.next_f64()?;
            }
            ValueData::AltAz { alt, az } => {
                *alt = params.next_f64()?;
                *az = params.next_f64()?;
            }
        }
        params.end()
    }

    pub fn as_integer(&self) -> Option<i64> {
        match &self.data {
            ValueData::Integer(v) => Some(i64::from(*v)),
            ValueData::LongInt(v) => Some(*v),
            ValueData::Selection { index, .. } => Some(i64::from(*index)),
            ValueData::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_double(&self) -> f64 {
        match &self.data {
            ValueData::Time(v) | ValueData::Double(v) => *v,
            ValueData::Float(v) => f64::from(*v),
            ValueData::Integer(v) => f64::from(*v),
            ValueData::LongInt(v) => *v as f64,
            ValueData::Bool(b) => f64::from(u8::from(*b)),
            ValueData::Stat(stat) | ValueData::Timeserie { stat, .. } => stat.value,
            ValueData::MinMax { value, .. } => *value,
            ValueData::String(s) => s.parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data {
            ValueData::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Selected entry name, `"UNK"` when the index is out of range.
    pub fn selection_name(&self) -> &str {
        match &self.data {
            ValueData::Selection { index, entries } => usize::try_from(*index)
                .ok()
                .and_then(|i| entries.get(i))
                .map_or("UNK", String::as_str),
            _ => "UNK",
        }
    }

    /// The `E` line announcing this value
    pub fn meta_line(&self) -> String {
        format!("E {} \"{}\" \"{}\"", self.flags, self.name, self.description)
    }

    /// The `V` line carrying the current content
    pub fn value_line(&self) -> String {
        format!("V {} {}", self.name, self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            ValueData::String(s) => write!(f, "\"{}\"", s),
            ValueData::Integer(v) => write!(f, "{}", v),
            ValueData::Time(v) | ValueData::Double(v) => write_double(f, *v),
            ValueData::Float(v) => write_double(f, f64::from(*v)),
            ValueData::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            ValueData::Selection { index, .. } => write!(f, "{}", index),
            ValueData::LongInt(v) => write!(f, "{}", v),
            ValueData::RaDec { ra: a, dec: b } | ValueData::AltAz { alt: a, az: b } => {
                write_double(f, *a)?;
                f.write_str(" ")?;
                write_double(f, *b)
            }
            ValueData::Stat(stat) => write_stat(f, stat),
            ValueData::MinMax { value, min, max } => write_doubles(f, &[*value, *min, *max]),
            ValueData::Rectangle { x, y, w, h } => write!(f, "{} {} {} {}", x, y, w, h),
            ValueData::Timeserie { stat, alpha, beta } => {
                write_stat(f, stat)?;
                f.write_str(" ")?;
                write_doubles(f, &[*alpha, *beta])
            }
            ValueData::StringArray(v) => {
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    if s.contains(' ') {
                        write!(f, "\"{}\"", s)?;
                    } else {
                        f.write_str(s)?;
                    }
                }
                Ok(())
            }
            ValueData::DoubleArray(v) | ValueData::TimeArray(v) => write_doubles(f, v),
            ValueData::IntegerArray(v) => write_joined(f, v),
            ValueData::BoolArray(v) => write_joined(f, v),
        }
    }
}

fn write_stat(f: &mut fmt::Formatter<'_>, stat: &Stat) -> fmt::Result {
    write_double(f, stat.value)?;
    write!(f, " {} ", stat.count)?;
    write_doubles(f, &[stat.mode, stat.min, stat.max, stat.stdev])
}

fn write_doubles(f: &mut fmt::Formatter<'_>, values: &[f64]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write_double(f, *v)?;
    }
    Ok(())
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}

fn write_double(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("nan")
    } else {
        write!(f, "{}", v)
    }
}

/// Result of an `E` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaChange {
    Created,
    /// Same type announced again; flags and description refreshed
    Updated,
    /// Existing value replaced by one of a different type
    Retyped,
}

/// Ordered set of values, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    values: Vec<Value>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|v| v.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.iter_mut().find(|v| v.name == name)
    }

    /// Add a value, replacing one of the same name in place.
    pub fn insert(&mut self, value: Value) {
        match self.values.iter_mut().find(|v| v.name == value.name) {
            Some(slot) => *slot = value,
            None => self.values.push(value),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.values.iter().position(|v| v.name == name)?;
        Some(self.values.remove(pos))
    }

    /// Apply an `E <flags> <name> <description>` announcement.
    ///
    /// A value announced with another type is replaced in place; when the
    /// new type is unsupported the old value is dropped and `None` returned.
    pub fn meta_info(&mut self, flags: i32, name: &str, description: &str) -> Option<MetaChange> {
        let pos = self.values.iter().position(|v| v.name == name);
        if let Some(pos) = pos {
            let existing = &mut self.values[pos];
            if existing.value_type() == flags & VALUE_MASK {
                existing.set_meta(flags, description);
                return Some(MetaChange::Updated);
            }
            self.values.remove(pos);
        }
        let value = Value::new(name, description, flags)?;
        match pos {
            Some(pos) => {
                self.values.insert(pos, value);
                Some(MetaChange::Retyped)
            }
            None => {
                self.values.push(value);
                Some(MetaChange::Created)
            }
        }
    }

    /// Empty a selection list. Returns false when `name` is not a selection.
    pub fn clear_selection(&mut self, name: &str) -> bool {
        match self.get_mut(name).map(|v| &mut v.data) {
            Some(ValueData::Selection { entries, .. }) => {
                entries.clear();
                true
            }
            _ => false,
        }
    }

    /// Append to a selection list. Returns false when `name` is not a selection.
    pub fn add_selection(&mut self, name: &str, entry: &str) -> bool {
        match self.get_mut(name).map(|v| &mut v.data) {
            Some(ValueData::Selection { entries, .. }) => {
                entries.push(entry.to_string());
                true
            }
            _ => false,
        }
    }

    /// Values with the warning or error bits set
    pub fn failed_values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter(|v| !v.is_good())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(table: &mut ValueTable, name: &str, payload: &str) -> ParamResult<()> {
        let mut params = Params::new(payload);
        table.get_mut(name).unwrap().set_from_params(&mut params, 1000.0)
    }

    // ==================== Meta Tests ====================

    #[test]
    fn test_meta_info_create_update_retype() {
        let mut table = ValueTable::new();
        assert_eq!(table.meta_info(VALUE_DOUBLE, "temp", "CCD temperature"), Some(MetaChange::Created));
        assert_eq!(
            table.meta_info(VALUE_DOUBLE | VALUE_WARNING, "temp", "chip temperature"),
            Some(MetaChange::Updated)
        );
        let temp = table.get("temp").unwrap();
        assert_eq!(temp.description(), "chip temperature");
        assert!(temp.is_warning());

        assert_eq!(table.meta_info(VALUE_STRING, "temp", "text"), Some(MetaChange::Retyped));
        assert_eq!(table.get("temp").unwrap().value_type(), VALUE_STRING);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_meta_info_rejects_unsupported_types() {
        let mut table = ValueTable::new();
        assert_eq!(table.meta_info(0x0f, "weird", ""), None);
        assert_eq!(table.meta_info(VALUE_ARRAY | VALUE_SELECTION, "sel_array", ""), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_retype_to_unsupported_drops_value() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_DOUBLE, "first", "");
        table.meta_info(VALUE_DOUBLE, "temp", "");
        table.meta_info(VALUE_DOUBLE, "last", "");
        assert_eq!(table.meta_info(0x0f, "temp", ""), None);
        assert!(table.get("temp").is_none());

        let names: Vec<_> = table.iter().map(Value::name).collect();
        assert_eq!(names, vec!["first", "last"]);
    }

    #[test]
    fn test_retype_keeps_position() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_DOUBLE, "a", "");
        table.meta_info(VALUE_DOUBLE, "b", "");
        assert_eq!(table.meta_info(VALUE_ARRAY | VALUE_DOUBLE, "a", ""), Some(MetaChange::Retyped));
        let names: Vec<_> = table.iter().map(Value::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(table.get("a").unwrap().value_type(), VALUE_ARRAY | VALUE_DOUBLE);
    }

    // ==================== Update Tests ====================

    #[test]
    fn test_value_updates_by_type() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_INTEGER, "count", "");
        table.meta_info(VALUE_STRING, "object", "");
        table.meta_info(VALUE_BOOL, "is_ov", "");
        table.meta_info(VALUE_RADEC, "tar", "");
        table.meta_info(VALUE_TIME, "infotime", "");

        update(&mut table, "count", "42").unwrap();
        update(&mut table, "object", "\"M 31\"").unwrap();
        update(&mut table, "is_ov", "true").unwrap();
        update(&mut table, "tar", "10.5 -3.25").unwrap();
        update(&mut table, "infotime", "+5").unwrap();

        assert_eq!(table.get("count").unwrap().as_integer(), Some(42));
        assert_eq!(table.get("object").unwrap().to_string(), "\"M 31\"");
        assert_eq!(table.get("is_ov").unwrap().as_bool(), Some(true));
        assert_eq!(
            table.get("tar").unwrap().data(),
            &ValueData::RaDec { ra: 10.5, dec: -3.25 }
        );
        assert_eq!(table.get("infotime").unwrap().as_double(), 1005.0);
    }

    #[test]
    fn test_value_update_rejects_garbage() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_INTEGER, "count", "");
        assert!(update(&mut table, "count", "many").is_err());
        assert!(update(&mut table, "count", "1 2").is_err());
    }

    #[test]
    fn test_nan_round_trips_as_text() {
        let value = Value::new("fwhm", "", VALUE_DOUBLE).unwrap();
        assert_eq!(value.value_line(), "V fwhm nan");
    }

    // ==================== Extended Type Tests ====================

    #[test]
    fn test_arrays() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_ARRAY | VALUE_DOUBLE, "fwhm", "");
        table.meta_info(VALUE_ARRAY | VALUE_INTEGER, "bins", "");
        table.meta_info(VALUE_ARRAY | VALUE_STRING, "names", "");
        table.meta_info(VALUE_ARRAY | VALUE_BOOL, "flags", "");
        table.meta_info(VALUE_ARRAY | VALUE_TIME, "stamps", "");

        update(&mut table, "fwhm", "1 2.5 nan").unwrap();
        update(&mut table, "bins", "\"1 2 3\"").unwrap();
        update(&mut table, "names", "R \"open slot\" B").unwrap();
        update(&mut table, "flags", "true off 1").unwrap();
        update(&mut table, "stamps", "5 +1").unwrap();

        let fwhm = table.get("fwhm").unwrap();
        assert!(matches!(fwhm.data(), ValueData::DoubleArray(v) if v.len() == 3 && v[1] == 2.5));
        assert_eq!(fwhm.value_line(), "V fwhm 1 2.5 nan");
        assert_eq!(table.get("bins").unwrap().data(), &ValueData::IntegerArray(vec![1, 2, 3]));
        assert_eq!(table.get("names").unwrap().to_string(), "R \"open slot\" B");
        assert_eq!(table.get("flags").unwrap().to_string(), "true false true");
        assert_eq!(table.get("stamps").unwrap().data(), &ValueData::TimeArray(vec![5.0, 1001.0]));

        update(&mut table, "fwhm", "").unwrap();
        assert_eq!(table.get("fwhm").unwrap().data(), &ValueData::DoubleArray(Vec::new()));
        assert!(update(&mut table, "bins", "1 x").is_err());
    }

    #[test]
    fn test_stat_minmax_rectangle_timeserie() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_STAT | VALUE_DOUBLE, "temp", "");
        table.meta_info(VALUE_MMAX | VALUE_DOUBLE, "exposure", "");
        table.meta_info(VALUE_RECTANGLE | VALUE_INTEGER, "window", "");
        table.meta_info(VALUE_TIMESERIE | VALUE_DOUBLE, "trend", "");

        update(&mut table, "temp", "10.5 4 10 9 12 1.5").unwrap();
        update(&mut table, "exposure", "5 0 3600").unwrap();
        update(&mut table, "window", "0 0 2048 1024").unwrap();
        update(&mut table, "trend", "1 2 1 0 2 0.5 0.25 -0.5").unwrap();

        let temp = table.get("temp").unwrap();
        assert_eq!(temp.as_double(), 10.5);
        assert!(matches!(temp.data(), ValueData::Stat(stat) if stat.count == 4 && stat.stdev == 1.5));
        assert_eq!(temp.value_line(), "V temp 10.5 4 10 9 12 1.5");
        assert_eq!(table.get("exposure").unwrap().to_string(), "5 0 3600");
        assert_eq!(
            table.get("window").unwrap().data(),
            &ValueData::Rectangle { x: 0, y: 0, w: 2048, h: 1024 }
        );
        assert_eq!(table.get("trend").unwrap().to_string(), "1 2 1 0 2 0.5 0.25 -0.5");

        assert!(update(&mut table, "window", "0 0 2048").is_err());
        assert!(update(&mut table, "temp", "1 2 3 4 5 6 7").is_err());
    }

    // ==================== Selection Tests ====================

    #[test]
    fn test_selection_entries() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_SELECTION, "filter", "");
        assert!(table.add_selection("filter", "R"));
        assert!(table.add_selection("filter", "V"));
        update(&mut table, "filter", "1").unwrap();
        assert_eq!(table.get("filter").unwrap().selection_name(), "V");

        assert!(table.clear_selection("filter"));
        assert_eq!(table.get("filter").unwrap().selection_name(), "UNK");

        table.meta_info(VALUE_INTEGER, "count", "");
        assert!(!table.add_selection("count", "x"));
        assert!(!table.clear_selection("missing"));
    }

    // ==================== Error Mask Tests ====================

    #[test]
    fn test_error_mask_changes_and_failed_values() {
        let mut table = ValueTable::new();
        table.meta_info(VALUE_DOUBLE, "temp", "");
        table.meta_info(VALUE_DOUBLE, "humidity", "");

        let temp = table.get_mut("temp").unwrap();
        assert!(temp.set_error_mask(VALUE_ERROR));
        assert!(!temp.set_error_mask(VALUE_ERROR));

        let failed: Vec<_> = table.failed_values().map(Value::name).collect();
        assert_eq!(failed, vec!["temp"]);

        table.get_mut("humidity").unwrap().set_error_mask(VALUE_WARNING);
        let failed: Vec<_> = table.failed_values().map(Value::name).collect();
        assert_eq!(failed, vec!["temp", "humidity"]);
        assert_eq!(
            table.get("temp").unwrap().meta_line(),
            format!("E {} \"temp\" \"\"", VALUE_DOUBLE | VALUE_ERROR)
        );
    }
}
