//! Text-preserving `KEY = value` editing of simulation control files.
//!
//! Every call reads the file fresh and writes it back whole. Lines that are
//! not assignments of the requested key are passed through byte for byte;
//! rewritten assignments keep their indentation and trailing comment.

use crate::error::{Result, RunnerError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const TRUE_TOKEN: &str = ".TRUE.";
const FALSE_TOKEN: &str = ".FALSE.";
const COMMENT_MARKERS: [char; 2] = ['#', '!'];

/// A control-file value after type inference.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ControlValue {
    /// Infers the type of a raw value: boolean, then integer, then float,
    /// then opaque text.
    pub fn parse(raw: &str) -> Self {
        let v = raw.trim();
        let upper = v.to_ascii_uppercase();
        if upper == TRUE_TOKEN {
            return ControlValue::Bool(true);
        }
        if upper == FALSE_TOKEN {
            return ControlValue::Bool(false);
        }
        if is_integer_literal(v) {
            if let Ok(n) = v.parse::<i64>() {
                return ControlValue::Int(n);
            }
        }
        if is_float_literal(v) {
            if let Ok(x) = v.parse::<f64>() {
                return ControlValue::Float(x);
            }
        }
        ControlValue::Text(v.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(true) => f.write_str(TRUE_TOKEN),
            ControlValue::Bool(false) => f.write_str(FALSE_TOKEN),
            ControlValue::Int(n) => write!(f, "{}", n),
            // Debug keeps a decimal point or exponent so the value reads back as a float.
            ControlValue::Float(x) => write!(f, "{:?}", x),
            ControlValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

impl From<i64> for ControlValue {
    fn from(v: i64) -> Self {
        ControlValue::Int(v)
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        ControlValue::Float(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        ControlValue::Text(v.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(v: String) -> Self {
        ControlValue::Text(v)
    }
}

fn strip_sign(v: &str) -> &str {
    v.strip_prefix(['+', '-']).unwrap_or(v)
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_integer_literal(v: &str) -> bool {
    all_digits(strip_sign(v))
}

// Accepts `1.`, `1.5`, `.5` with an optional exponent, or `1e5`.
fn is_float_literal(v: &str) -> bool {
    let body = strip_sign(v);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    if let Some(exp) = exponent {
        if !all_digits(strip_sign(exp)) {
            return false;
        }
    }
    match mantissa.split_once('.') {
        Some((int_part, frac_part)) => {
            let int_ok = int_part.is_empty() || all_digits(int_part);
            let frac_ok = frac_part.is_empty() || all_digits(frac_part);
            int_ok && frac_ok && !(int_part.is_empty() && frac_part.is_empty())
        }
        None => exponent.is_some() && all_digits(mantissa),
    }
}

/// One assignment line split into its preserved parts.
struct Assignment<'a> {
    indent: &'a str,
    key: &'a str,
    value: &'a str,
    /// Whitespace between the value and the comment marker.
    gap: &'a str,
    comment: &'a str,
    newline: &'a str,
}

fn split_newline(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn parse_assignment(line: &str) -> Option<Assignment<'_>> {
    let (body, newline) = split_newline(line);
    let (lhs, rhs) = body.split_once('=')?;
    let key = lhs.trim();
    if key.is_empty() || key.contains(char::is_whitespace) || key.contains(COMMENT_MARKERS) {
        return None;
    }
    let indent = &lhs[..lhs.len() - lhs.trim_start().len()];
    let (value_part, comment) = match rhs.find(COMMENT_MARKERS) {
        Some(pos) => (&rhs[..pos], &rhs[pos..]),
        None => (rhs, ""),
    };
    let value = value_part.trim();
    let gap = if comment.is_empty() {
        ""
    } else {
        &value_part[value_part.trim_end().len()..]
    };
    Some(Assignment {
        indent,
        key,
        value,
        gap,
        comment,
        newline,
    })
}

/// Handle on one control file on disk. Holds no cached content.
#[derive(Debug, Clone)]
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RunnerError::missing("control file", path));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let text = fs::read_to_string(&self.path)?;
        Ok(text.split_inclusive('\n').map(str::to_string).collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        fs::write(&self.path, lines.concat())?;
        Ok(())
    }

    /// Value of the first assignment of `key`, scanning top to bottom.
    pub fn get(&self, key: &str) -> Result<Option<ControlValue>> {
        for line in self.read_lines()? {
            if let Some(a) = parse_assignment(&line) {
                if a.key == key {
                    return Ok(Some(ControlValue::parse(a.value)));
                }
            }
        }
        Ok(None)
    }

    /// Rewrites every assignment of `key`, or appends one if there is none.
    pub fn set(&self, key: &str, value: impl Into<ControlValue>) -> Result<()> {
        let rendered = value.into().to_string();
        let mut found = false;
        let mut lines = self.read_lines()?;
        for line in lines.iter_mut() {
            let replacement = match parse_assignment(line) {
                Some(a) if a.key == key => format!(
                    "{}{} = {}{}{}{}",
                    a.indent, a.key, rendered, a.gap, a.comment, a.newline
                ),
                _ => continue,
            };
            *line = replacement;
            found = true;
        }
        if !found {
            if let Some(last) = lines.last_mut() {
                if !last.ends_with('\n') {
                    last.push('\n');
                }
            }
            lines.push(format!("{} = {}\n", key, rendered));
        }
        self.write_lines(&lines)
    }

    /// Removes every line that assigns `key`. Returns how many were removed.
    pub fn delete(&self, key: &str) -> Result<usize> {
        let lines = self.read_lines()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| !matches!(parse_assignment(line), Some(a) if a.key == key))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_lines(&kept)?;
        }
        Ok(removed)
    }
}
