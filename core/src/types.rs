//! The CIM typed value system.
//!
//! # Design
//! `CimScalar` is the sum of every scalar a CIM value can carry; `CimValue`
//! adds the array shape on top. Values carry their concrete Rust
//! representation and map to a `CimType` code, so a value round-trips
//! through the wire encoding without loss. Integer widths are enforced when
//! parsing wire text; reals keep the `NAN`/`INF` spellings DSP0201 uses.
//!
//! Equality treats two NaNs as equal and `0.0 == -0.0`, and the manual
//! `Hash` impls stay consistent with that, so values can key maps.

use std::hash::{Hash, Hasher};

use crate::datetime::CimDateTime;
use crate::model::CimInstanceName;

/// CIM type codes, named as they appear in `TYPE` attributes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CimType {
    Boolean,
    String,
    Char16,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Real32,
    Real64,
    DateTime,
    Reference,
}

impl CimType {
    pub fn wire_name(self) -> &'static str {
        match self {
            CimType::Boolean => "boolean",
            CimType::String => "string",
            CimType::Char16 => "char16",
            CimType::Uint8 => "uint8",
            CimType::Uint16 => "uint16",
            CimType::Uint32 => "uint32",
            CimType::Uint64 => "uint64",
            CimType::Sint8 => "sint8",
            CimType::Sint16 => "sint16",
            CimType::Sint32 => "sint32",
            CimType::Sint64 => "sint64",
            CimType::Real32 => "real32",
            CimType::Real64 => "real64",
            CimType::DateTime => "datetime",
            CimType::Reference => "reference",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<CimType> {
        Some(match name {
            "boolean" => CimType::Boolean,
            "string" => CimType::String,
            "char16" => CimType::Char16,
            "uint8" => CimType::Uint8,
            "uint16" => CimType::Uint16,
            "uint32" => CimType::Uint32,
            "uint64" => CimType::Uint64,
            "sint8" => CimType::Sint8,
            "sint16" => CimType::Sint16,
            "sint32" => CimType::Sint32,
            "sint64" => CimType::Sint64,
            "real32" => CimType::Real32,
            "real64" => CimType::Real64,
            "datetime" => CimType::DateTime,
            "reference" => CimType::Reference,
            _ => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            CimType::Uint8
                | CimType::Uint16
                | CimType::Uint32
                | CimType::Uint64
                | CimType::Sint8
                | CimType::Sint16
                | CimType::Sint32
                | CimType::Sint64
        )
    }

    pub fn is_real(self) -> bool {
        matches!(self, CimType::Real32 | CimType::Real64)
    }
}

impl std::fmt::Display for CimType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A single typed CIM scalar.
///
/// `Reference` holds a full object path, which may itself contain reference
/// keybindings; paths are values, so the shape is recursive but never
/// cyclic.
#[derive(Debug, Clone)]
pub enum CimScalar {
    Boolean(bool),
    String(String),
    Char16(char),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Sint8(i8),
    Sint16(i16),
    Sint32(i32),
    Sint64(i64),
    Real32(f32),
    Real64(f64),
    DateTime(CimDateTime),
    Reference(Box<CimInstanceName>),
}

impl CimScalar {
    pub fn cim_type(&self) -> CimType {
        match self {
            CimScalar::Boolean(_) => CimType::Boolean,
            CimScalar::String(_) => CimType::String,
            CimScalar::Char16(_) => CimType::Char16,
            CimScalar::Uint8(_) => CimType::Uint8,
            CimScalar::Uint16(_) => CimType::Uint16,
            CimScalar::Uint32(_) => CimType::Uint32,
            CimScalar::Uint64(_) => CimType::Uint64,
            CimScalar::Sint8(_) => CimType::Sint8,
            CimScalar::Sint16(_) => CimType::Sint16,
            CimScalar::Sint32(_) => CimType::Sint32,
            CimScalar::Sint64(_) => CimType::Sint64,
            CimScalar::Real32(_) => CimType::Real32,
            CimScalar::Real64(_) => CimType::Real64,
            CimScalar::DateTime(_) => CimType::DateTime,
            CimScalar::Reference(_) => CimType::Reference,
        }
    }

    /// Wire text for `<VALUE>` and `<KEYVALUE>` content. `Reference` has no
    /// text form (it is encoded as `<VALUE.REFERENCE>`) and returns `None`.
    pub fn wire_text(&self) -> Option<String> {
        Some(match self {
            CimScalar::Boolean(true) => "TRUE".to_string(),
            CimScalar::Boolean(false) => "FALSE".to_string(),
            CimScalar::String(s) => s.clone(),
            CimScalar::Char16(c) => c.to_string(),
            CimScalar::Uint8(v) => v.to_string(),
            CimScalar::Uint16(v) => v.to_string(),
            CimScalar::Uint32(v) => v.to_string(),
            CimScalar::Uint64(v) => v.to_string(),
            CimScalar::Sint8(v) => v.to_string(),
            CimScalar::Sint16(v) => v.to_string(),
            CimScalar::Sint32(v) => v.to_string(),
            CimScalar::Sint64(v) => v.to_string(),
            CimScalar::Real32(v) => format_real32(*v),
            CimScalar::Real64(v) => format_real64(*v),
            CimScalar::DateTime(dt) => dt.to_string(),
            CimScalar::Reference(_) => return None,
        })
    }

    /// Parse wire text into a scalar of the given type, enforcing integer
    /// width limits. `Reference` is not text-typed and is rejected here.
    pub fn parse(cim_type: CimType, text: &str) -> Result<CimScalar, String> {
        let trimmed = text.trim();
        Ok(match cim_type {
            CimType::Boolean => match trimmed.to_ascii_uppercase().as_str() {
                "TRUE" => CimScalar::Boolean(true),
                "FALSE" => CimScalar::Boolean(false),
                _ => return Err(format!("invalid boolean value {trimmed:?}")),
            },
            // String and char16 content is significant whitespace; no trim.
            CimType::String => CimScalar::String(text.to_string()),
            CimType::Char16 => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => CimScalar::Char16(c),
                    _ => return Err(format!("char16 value must be one character, got {text:?}")),
                }
            }
            CimType::Uint8 => CimScalar::Uint8(narrow(trimmed, cim_type)?),
            CimType::Uint16 => CimScalar::Uint16(narrow(trimmed, cim_type)?),
            CimType::Uint32 => CimScalar::Uint32(narrow(trimmed, cim_type)?),
            CimType::Uint64 => CimScalar::Uint64(narrow(trimmed, cim_type)?),
            CimType::Sint8 => CimScalar::Sint8(narrow(trimmed, cim_type)?),
            CimType::Sint16 => CimScalar::Sint16(narrow(trimmed, cim_type)?),
            CimType::Sint32 => CimScalar::Sint32(narrow(trimmed, cim_type)?),
            CimType::Sint64 => CimScalar::Sint64(narrow(trimmed, cim_type)?),
            CimType::Real32 => CimScalar::Real32(
                trimmed
                    .parse::<f32>()
                    .map_err(|_| format!("invalid real32 value {trimmed:?}"))?,
            ),
            CimType::Real64 => CimScalar::Real64(
                trimmed
                    .parse::<f64>()
                    .map_err(|_| format!("invalid real64 value {trimmed:?}"))?,
            ),
            CimType::DateTime => CimScalar::DateTime(CimDateTime::parse(trimmed)?),
            CimType::Reference => {
                return Err("reference values have no text form".to_string());
            }
        })
    }
}

/// Parse integer wire text (decimal or `0x` hex, optional sign) and check
/// it against the target width.
fn narrow<T>(text: &str, cim_type: CimType) -> Result<T, String>
where
    T: TryFrom<i128>,
{
    let wide = parse_integer(text)?;
    T::try_from(wide).map_err(|_| format!("value {wide} out of range for {cim_type}"))
}

fn parse_integer(text: &str) -> Result<i128, String> {
    let (negative, t) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        t.parse::<u64>()
    };
    let magnitude = parsed.map_err(|_| format!("invalid integer value {text:?}"))? as i128;
    Ok(if negative { -magnitude } else { magnitude })
}

pub(crate) fn format_real64(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f64::INFINITY {
        "INF".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INF".to_string()
    } else {
        format!("{v:?}")
    }
}

pub(crate) fn format_real32(v: f32) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v == f32::INFINITY {
        "INF".to_string()
    } else if v == f32::NEG_INFINITY {
        "-INF".to_string()
    } else {
        format!("{v:?}")
    }
}

impl PartialEq for CimScalar {
    fn eq(&self, other: &Self) -> bool {
        use CimScalar::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Char16(a), Char16(b)) => a == b,
            (Uint8(a), Uint8(b)) => a == b,
            (Uint16(a), Uint16(b)) => a == b,
            (Uint32(a), Uint32(b)) => a == b,
            (Uint64(a), Uint64(b)) => a == b,
            (Sint8(a), Sint8(b)) => a == b,
            (Sint16(a), Sint16(b)) => a == b,
            (Sint32(a), Sint32(b)) => a == b,
            (Sint64(a), Sint64(b)) => a == b,
            (Real32(a), Real32(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Real64(a), Real64(b)) => a == b || (a.is_nan() && b.is_nan()),
            (DateTime(a), DateTime(b)) => a == b,
            (Reference(a), Reference(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for CimScalar {}

impl Hash for CimScalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            CimScalar::Boolean(v) => v.hash(state),
            CimScalar::String(v) => v.hash(state),
            CimScalar::Char16(v) => v.hash(state),
            CimScalar::Uint8(v) => v.hash(state),
            CimScalar::Uint16(v) => v.hash(state),
            CimScalar::Uint32(v) => v.hash(state),
            CimScalar::Uint64(v) => v.hash(state),
            CimScalar::Sint8(v) => v.hash(state),
            CimScalar::Sint16(v) => v.hash(state),
            CimScalar::Sint32(v) => v.hash(state),
            CimScalar::Sint64(v) => v.hash(state),
            CimScalar::Real32(v) => hash_bits(norm32(*v) as u64, state),
            CimScalar::Real64(v) => hash_bits(norm64(*v), state),
            CimScalar::DateTime(v) => v.hash(state),
            CimScalar::Reference(v) => v.hash(state),
        }
    }
}

// Canonical bit forms so hashing agrees with equality: every NaN collapses
// to one pattern, and -0.0 collapses to +0.0.
fn norm64(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

fn norm32(v: f32) -> u32 {
    if v.is_nan() {
        f32::NAN.to_bits()
    } else if v == 0.0 {
        0.0f32.to_bits()
    } else {
        v.to_bits()
    }
}

fn hash_bits<H: Hasher>(bits: u64, state: &mut H) {
    bits.hash(state);
}

/// A CIM value: one scalar, or an ordered array of scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CimValue {
    Scalar(CimScalar),
    Array(Vec<CimScalar>),
}

impl CimValue {
    pub fn is_array(&self) -> bool {
        matches!(self, CimValue::Array(_))
    }

    /// The type of the carried value. Empty arrays carry no intrinsic type;
    /// the declaration (property or parameter) supplies it.
    pub fn cim_type(&self) -> Option<CimType> {
        match self {
            CimValue::Scalar(s) => Some(s.cim_type()),
            CimValue::Array(items) => items.first().map(CimScalar::cim_type),
        }
    }

    pub fn string(s: &str) -> CimValue {
        CimValue::Scalar(CimScalar::String(s.to_string()))
    }

    pub fn boolean(b: bool) -> CimValue {
        CimValue::Scalar(CimScalar::Boolean(b))
    }

    pub fn uint32(v: u32) -> CimValue {
        CimValue::Scalar(CimScalar::Uint32(v))
    }
}
