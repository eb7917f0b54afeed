//! Positional parameter parsing for protocol lines
//!
//! Lines are whitespace separated tokens. A token starting with `"` runs
//! to the next `"` and may contain spaces. Numeric tokens additionally
//! stop at `,` so that `1,2` parses as two integers.

/// Parameter parsing error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("missing parameter")]
    Missing,

    #[error("invalid {expected} parameter: {token:?}")]
    Invalid {
        expected: &'static str,
        token: String,
    },

    #[error("unexpected trailing parameters: {0:?}")]
    Trailing(String),
}

pub type ParamResult<T> = std::result::Result<T, ParamError>;

/// Cursor over the parameters of one protocol line.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    rest: &'a str,
}

impl<'a> Params<'a> {
    pub fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    /// Split a line into its leading command token and the remaining parameters.
    pub fn split_command(line: &'a str) -> (&'a str, Params<'a>) {
        let line = line.trim_start();
        match line.find(char::is_whitespace) {
            Some(pos) => (&line[..pos], Params::new(&line[pos..])),
            None => (line, Params::new("")),
        }
    }

    fn skip_space(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// True when only whitespace remains.
    pub fn is_end(&mut self) -> bool {
        self.skip_space();
        self.rest.is_empty()
    }

    /// Fail unless only whitespace remains.
    pub fn end(&mut self) -> ParamResult<()> {
        if self.is_end() {
            Ok(())
        } else {
            Err(ParamError::Trailing(self.rest.to_string()))
        }
    }

    fn token(&mut self, stop_at_comma: bool) -> ParamResult<&'a str> {
        self.skip_space();
        if self.rest.is_empty() {
            return Err(ParamError::Missing);
        }
        if let Some(quoted) = self.rest.strip_prefix('"') {
            let (tok, rest) = match quoted.find('"') {
                Some(pos) => (&quoted[..pos], &quoted[pos + 1..]),
                None => (quoted, ""),
            };
            self.rest = rest;
            return Ok(tok);
        }
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || (stop_at_comma && c == ','))
            .unwrap_or(self.rest.len());
        let tok = &self.rest[..end];
        // consume the delimiter as well
        let skip = self.rest[end..].chars().next().map_or(0, char::len_utf8);
        self.rest = &self.rest[end + skip..];
        Ok(tok)
    }

    /// Next string token, unquoting `"..."`.
    pub fn next_string(&mut self) -> ParamResult<&'a str> {
        self.token(false)
    }

    /// Next string token, or `None` when the line has ended.
    pub fn next_string_opt(&mut self) -> ParamResult<Option<&'a str>> {
        if self.is_end() {
            Ok(None)
        } else {
            self.next_string().map(Some)
        }
    }

    /// Everything remaining, with leading whitespace removed.
    pub fn rest(&mut self) -> &'a str {
        self.skip_space();
        let rest = self.rest;
        self.rest = "";
        rest
    }

    /// Drop quotes wrapping everything remaining, so `"1 2 3"` reads as
    /// three tokens.
    pub fn unquote_rest(&mut self) {
        let rest = self.rest.trim();
        if let Some(inner) = rest.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            self.rest = inner;
        }
    }

    pub fn next_i32(&mut self) -> ParamResult<i32> {
        let tok = self.token(true)?;
        tok.parse().map_err(|_| invalid("integer", tok))
    }

    pub fn next_i64(&mut self) -> ParamResult<i64> {
        let tok = self.token(true)?;
        tok.parse().map_err(|_| invalid("long integer", tok))
    }

    pub fn next_usize(&mut self) -> ParamResult<usize> {
        let tok = self.token(false)?;
        tok.parse().map_err(|_| invalid("size", tok))
    }

    /// Status words travel as signed long integers; reinterpret the low 32 bits.
    pub fn next_status(&mut self) -> ParamResult<u32> {
        let tok = self.token(true)?;
        tok.parse::<i64>()
            .map(|v| v as u32)
            .map_err(|_| invalid("status", tok))
    }

    /// Floating point value; `nan` is accepted.
    pub fn next_f64(&mut self) -> ParamResult<f64> {
        let tok = self.token(true)?;
        if tok == "nan" {
            return Ok(f64::NAN);
        }
        tok.parse().map_err(|_| invalid("double", tok))
    }

    /// Time value; a leading `+` makes it relative to `now`.
    pub fn next_time(&mut self, now: f64) -> ParamResult<f64> {
        let tok = self.token(true)?;
        if tok == "nan" {
            return Ok(f64::NAN);
        }
        let value: f64 = tok.parse().map_err(|_| invalid("time", tok))?;
        if tok.starts_with('+') {
            Ok(value + now)
        } else {
            Ok(value)
        }
    }

    /// Seconds and microseconds as two integers.
    pub fn next_timeval(&mut self) -> ParamResult<(i64, i64)> {
        let sec = self.next_i64()?;
        let usec = self.next_i64()?;
        Ok((sec, usec))
    }
}

fn invalid(expected: &'static str, token: &str) -> ParamError {
    ParamError::Invalid {
        expected,
        token: token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        let (cmd, mut params) = Params::split_command("device 0 3 C0 localhost 5556 3");
        assert_eq!(cmd, "device");
        assert_eq!(params.next_i32().unwrap(), 0);
        assert_eq!(params.next_i32().unwrap(), 3);
        assert_eq!(params.next_string().unwrap(), "C0");
        assert_eq!(params.next_string().unwrap(), "localhost");
        assert_eq!(params.next_i32().unwrap(), 5556);
        assert_eq!(params.next_i32().unwrap(), 3);
        assert!(params.end().is_ok());
    }

    #[test]
    fn test_split_command_without_params() {
        let (cmd, mut params) = Params::split_command("info");
        assert_eq!(cmd, "info");
        assert!(params.is_end());
    }

    #[test]
    fn test_quoted_string() {
        let mut params = Params::new(r#" "camera exposure time" 12"#);
        assert_eq!(params.next_string().unwrap(), "camera exposure time");
        assert_eq!(params.next_i32().unwrap(), 12);
    }

    #[test]
    fn test_empty_quoted_string() {
        let mut params = Params::new(r#""" x"#);
        assert_eq!(params.next_string().unwrap(), "");
        assert_eq!(params.next_string().unwrap(), "x");
    }

    #[test]
    fn test_comma_separated_integers() {
        let mut params = Params::new("1,2 3");
        assert_eq!(params.next_i32().unwrap(), 1);
        assert_eq!(params.next_i32().unwrap(), 2);
        assert_eq!(params.next_i32().unwrap(), 3);
    }

    #[test]
    fn test_missing_and_invalid() {
        let mut params = Params::new("abc");
        assert!(matches!(params.next_i32(), Err(ParamError::Invalid { .. })));
        assert_eq!(params.next_string(), Err(ParamError::Missing));
    }

    #[test]
    fn test_trailing_parameters() {
        let mut params = Params::new("1 2");
        params.next_i32().unwrap();
        assert_eq!(params.end(), Err(ParamError::Trailing("2".into())));
    }

    #[test]
    fn test_nan_double() {
        let mut params = Params::new("nan 1.5");
        assert!(params.next_f64().unwrap().is_nan());
        assert_eq!(params.next_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_relative_time() {
        let mut params = Params::new("+10 20");
        assert_eq!(params.next_time(100.0).unwrap(), 110.0);
        assert_eq!(params.next_time(100.0).unwrap(), 20.0);
    }

    #[test]
    fn test_status_word_wraps_to_u32() {
        let mut params = Params::new("2147483648 -1");
        assert_eq!(params.next_status().unwrap(), 0x8000_0000);
        assert_eq!(params.next_status().unwrap(), u32::MAX);
    }

    #[test]
    fn test_rest_of_line() {
        let mut params = Params::new("12 34 origin   free text here");
        assert_eq!(params.next_timeval().unwrap(), (12, 34));
        assert_eq!(params.next_string().unwrap(), "origin");
        assert_eq!(params.rest(), "free text here");
        assert!(params.is_end());
    }

    #[test]
    fn test_unquote_rest() {
        let mut params = Params::new(r#" "1.5 2 3" "#);
        params.unquote_rest();
        assert_eq!(params.next_f64().unwrap(), 1.5);
        assert_eq!(params.next_i32().unwrap(), 2);
        assert_eq!(params.next_i32().unwrap(), 3);
        assert!(params.is_end());

        let mut params = Params::new(r#""a b" c"#);
        params.unquote_rest();
        assert_eq!(params.next_string().unwrap(), "a b");
    }
}
