//! Attribute values.

use crate::error::{IoError, Result};
use crate::types::TypeTag;
use std::fmt;

/// A typed attribute value. The length is intrinsic: element count for
/// numeric arrays, byte length for strings.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Unsigned bytes.
    Byte(Vec<u8>),
    /// Signed characters.
    Char(Vec<i8>),
    /// Text.
    Str(String),
    /// 16-bit integers.
    Short(Vec<i16>),
    /// 32-bit integers.
    Int(Vec<i32>),
    /// 64-bit integers.
    Long(Vec<i64>),
    /// 32-bit floats.
    Float(Vec<f32>),
    /// 64-bit floats.
    Double(Vec<f64>),
}

impl AttrValue {
    /// Portable tag of the element type.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            AttrValue::Byte(_) => TypeTag::Byte,
            AttrValue::Char(_) => TypeTag::Char,
            AttrValue::Str(_) => TypeTag::String,
            AttrValue::Short(_) => TypeTag::Short,
            AttrValue::Int(_) => TypeTag::Int,
            AttrValue::Long(_) => TypeTag::Long,
            AttrValue::Float(_) => TypeTag::Float,
            AttrValue::Double(_) => TypeTag::Double,
        }
    }

    /// Stored length.
    pub fn len(&self) -> usize {
        match self {
            AttrValue::Byte(v) => v.len(),
            AttrValue::Char(v) => v.len(),
            AttrValue::Str(v) => v.len(),
            AttrValue::Short(v) => v.len(),
            AttrValue::Int(v) => v.len(),
            AttrValue::Long(v) => v.len(),
            AttrValue::Float(v) => v.len(),
            AttrValue::Double(v) => v.len(),
        }
    }

    /// Whether the value holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text content of a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content widened to `i64`.
    pub fn to_i64s(&self) -> Option<Vec<i64>> {
        match self {
            AttrValue::Byte(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            AttrValue::Char(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            AttrValue::Short(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            AttrValue::Int(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            AttrValue::Long(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Numeric content widened to `f64`.
    pub fn to_f64s(&self) -> Option<Vec<f64>> {
        match self {
            AttrValue::Float(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            AttrValue::Double(v) => Some(v.clone()),
            other => other
                .to_i64s()
                .map(|v| v.into_iter().map(|x| x as f64).collect()),
        }
    }

    /// First integer element.
    pub fn first_i64(&self) -> Option<i64> {
        self.to_i64s().and_then(|v| v.first().copied())
    }

    /// Integer array attribute as non-negative extents.
    pub(crate) fn to_extents(&self, name: &str) -> Result<Vec<usize>> {
        let values = self.to_i64s().ok_or_else(|| IoError::AttributeType {
            name: name.to_string(),
            expected: "integers",
            found: self.type_tag(),
        })?;
        values
            .into_iter()
            .map(|v| {
                usize::try_from(v).map_err(|_| {
                    IoError::InvalidShape(format!("attribute {name} holds negative value {v}"))
                })
            })
            .collect()
    }

    /// Integer array attribute narrowed to `i32`.
    pub(crate) fn to_i32s(&self, name: &str) -> Result<Vec<i32>> {
        let values = self.to_i64s().ok_or_else(|| IoError::AttributeType {
            name: name.to_string(),
            expected: "integers",
            found: self.type_tag(),
        })?;
        values
            .into_iter()
            .map(|v| {
                i32::try_from(v).map_err(|_| {
                    IoError::InvalidShape(format!("attribute {name} value {v} overflows int"))
                })
            })
            .collect()
    }

    /// Extents as a stored int array.
    pub(crate) fn from_extents(values: &[usize]) -> Result<Self> {
        values
            .iter()
            .map(|&v| {
                i32::try_from(v)
                    .map_err(|_| IoError::InvalidShape(format!("extent {v} overflows int")))
            })
            .collect::<Result<Vec<_>>>()
            .map(AttrValue::Int)
    }

    /// Append the wire form: `i32` type code, `u32` length, payload.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_tag().code().to_le_bytes());
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        match self {
            AttrValue::Byte(v) => out.extend_from_slice(v),
            AttrValue::Char(v) => out.extend(v.iter().map(|x| x.to_le_bytes()[0])),
            AttrValue::Str(v) => out.extend_from_slice(v.as_bytes()),
            AttrValue::Short(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            AttrValue::Int(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            AttrValue::Long(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            AttrValue::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            AttrValue::Double(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
    }

    /// Decode the wire form, returning the value and the bytes consumed.
    pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<(Self, usize), String> {
        if bytes.len() < 8 {
            return Err("truncated attribute header".into());
        }
        let code = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let tag = TypeTag::from_code(code).ok_or_else(|| format!("unknown type code {code}"))?;
        let width = if tag == TypeTag::String { 1 } else { tag.size_of() };
        if width == 0 {
            return Err(format!("attribute of type {tag}"));
        }
        let end = 8 + len * width;
        let payload = bytes
            .get(8..end)
            .ok_or_else(|| format!("attribute payload of {} bytes truncated", len * width))?;

        macro_rules! numbers {
            ($ty:ty, $variant:ident) => {
                AttrValue::$variant(
                    payload
                        .chunks_exact(std::mem::size_of::<$ty>())
                        .map(|c| {
                            let mut word = [0u8; std::mem::size_of::<$ty>()];
                            word.copy_from_slice(c);
                            <$ty>::from_le_bytes(word)
                        })
                        .collect(),
                )
            };
        }

        let value = match tag {
            TypeTag::Byte => AttrValue::Byte(payload.to_vec()),
            TypeTag::Char => numbers!(i8, Char),
            TypeTag::String => AttrValue::Str(
                String::from_utf8(payload.to_vec()).map_err(|e| format!("string attribute: {e}"))?,
            ),
            TypeTag::Short => numbers!(i16, Short),
            TypeTag::Int => numbers!(i32, Int),
            TypeTag::Long => numbers!(i64, Long),
            TypeTag::Float => numbers!(f32, Float),
            TypeTag::Double => numbers!(f64, Double),
            TypeTag::Unknown => return Err("attribute of unknown type".into()),
        };
        Ok((value, end))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
            if let [single] = values {
                return write!(f, "{single}");
            }
            let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", parts.join(", "))
        }
        match self {
            AttrValue::Str(s) => write!(f, "\"{s}\""),
            AttrValue::Byte(v) => list(f, v),
            AttrValue::Char(v) => list(f, v),
            AttrValue::Short(v) => list(f, v),
            AttrValue::Int(v) => list(f, v),
            AttrValue::Long(v) => list(f, v),
            AttrValue::Float(v) => list(f, v),
            AttrValue::Double(v) => list(f, v),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for AttrValue {
                fn from(value: $ty) -> Self {
                    AttrValue::$variant(vec![value])
                }
            }

            impl From<Vec<$ty>> for AttrValue {
                fn from(values: Vec<$ty>) -> Self {
                    AttrValue::$variant(values)
                }
            }

            impl From<&[$ty]> for AttrValue {
                fn from(values: &[$ty]) -> Self {
                    AttrValue::$variant(values.to_vec())
                }
            }
        )*
    };
}

impl_from!(
    u8 => Byte,
    i8 => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
);

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

/// Native value recoverable from an [`AttrValue`] of the matching type.
pub trait FromAttr: Sized {
    /// Extract the value, `None` when the stored type differs.
    fn from_attr(value: &AttrValue) -> Option<Self>;
}

macro_rules! impl_from_attr {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromAttr for $ty {
                fn from_attr(value: &AttrValue) -> Option<Self> {
                    match value {
                        AttrValue::$variant(v) => v.first().copied(),
                        _ => None,
                    }
                }
            }

            impl FromAttr for Vec<$ty> {
                fn from_attr(value: &AttrValue) -> Option<Self> {
                    match value {
                        AttrValue::$variant(v) => Some(v.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_from_attr!(
    u8 => Byte,
    i8 => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
);

impl FromAttr for String {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromAttr for AttrValue {
    fn from_attr(value: &AttrValue) -> Option<Self> {
        Some(value.clone())
    }
}
