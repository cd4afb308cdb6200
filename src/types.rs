//! Portable type identification.
//!
//! A [`TypeTag`] names an element type independently of any storage format.
//! The numeric codes are what the tag container persists on disk.

use std::any::TypeId;
use std::fmt;

/// Portable element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum TypeTag {
    /// Unrecognized type.
    #[default]
    Unknown = 0,
    /// Unsigned 8-bit integer.
    Byte = 100,
    /// Signed 8-bit character.
    Char = 300,
    /// Variable-width string.
    String = 333,
    /// 16-bit integer.
    Short = 400,
    /// 32-bit integer.
    Int = 500,
    /// 64-bit integer.
    Long = 600,
    /// 32-bit float.
    Float = 700,
    /// 64-bit float.
    Double = 800,
}

impl TypeTag {
    /// Every tag, in code order.
    pub const ALL: [TypeTag; 9] = [
        TypeTag::Unknown,
        TypeTag::Byte,
        TypeTag::Char,
        TypeTag::String,
        TypeTag::Short,
        TypeTag::Int,
        TypeTag::Long,
        TypeTag::Float,
        TypeTag::Double,
    ];

    /// Byte width, 0 for unknown and string.
    pub fn size_of(self) -> usize {
        match self {
            TypeTag::Byte | TypeTag::Char => 1,
            TypeTag::Short => 2,
            TypeTag::Int | TypeTag::Float => 4,
            TypeTag::Long | TypeTag::Double => 8,
            TypeTag::Unknown | TypeTag::String => 0,
        }
    }

    /// Stored numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Tag for a stored numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.code() == code)
    }

    /// Whether elements of this type have a fixed width.
    pub fn is_fixed_width(self) -> bool {
        self.size_of() > 0
    }

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Unknown => "unknown",
            TypeTag::Byte => "byte",
            TypeTag::Char => "char",
            TypeTag::String => "string",
            TypeTag::Short => "short",
            TypeTag::Int => "int",
            TypeTag::Long => "long",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte width of `tag`.
pub fn size_of(tag: TypeTag) -> usize {
    tag.size_of()
}

/// Identify the portable tag of a value's type.
///
/// Unrecognized types yield [`TypeTag::Unknown`] and a logged warning.
pub fn identify<T: ?Sized + 'static>(_value: &T) -> TypeTag {
    let id = TypeId::of::<T>();
    let tag = if id == TypeId::of::<u8>() {
        TypeTag::Byte
    } else if id == TypeId::of::<i8>() {
        TypeTag::Char
    } else if id == TypeId::of::<String>() || id == TypeId::of::<str>() {
        TypeTag::String
    } else if id == TypeId::of::<i16>() {
        TypeTag::Short
    } else if id == TypeId::of::<i32>() {
        TypeTag::Int
    } else if id == TypeId::of::<i64>() {
        TypeTag::Long
    } else if id == TypeId::of::<f32>() {
        TypeTag::Float
    } else if id == TypeId::of::<f64>() {
        TypeTag::Double
    } else {
        TypeTag::Unknown
    };
    if tag == TypeTag::Unknown {
        tracing::warn!("Unable to identify type {}", std::any::type_name::<T>());
    }
    tag
}

/// Fixed-width element type that can be stored in an array variable.
pub trait Element:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Portable tag of this type.
    const TAG: TypeTag;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TAG: TypeTag = TypeTag::$tag;
            }
        )*
    };
}

impl_element!(
    u8 => Byte,
    i8 => Char,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_native_types() {
        assert_eq!(identify(&1u8), TypeTag::Byte);
        assert_eq!(identify(&1i8), TypeTag::Char);
        assert_eq!(identify(&1i16), TypeTag::Short);
        assert_eq!(identify(&1i32), TypeTag::Int);
        assert_eq!(identify(&1i64), TypeTag::Long);
        assert_eq!(identify(&1.0f32), TypeTag::Float);
        assert_eq!(identify(&1.0f64), TypeTag::Double);
        assert_eq!(identify(&String::from("units")), TypeTag::String);
        assert_eq!(identify("units"), TypeTag::String);
    }

    #[test]
    fn unknown_types_do_not_panic() {
        assert_eq!(identify(&(1u32, 2u32)), TypeTag::Unknown);
        assert_eq!(identify(&vec![1.0f32]), TypeTag::Unknown);
    }

    #[test]
    fn widths() {
        assert_eq!(size_of(TypeTag::Unknown), 0);
        assert_eq!(size_of(TypeTag::String), 0);
        assert_eq!(size_of(TypeTag::Byte), 1);
        assert_eq!(size_of(TypeTag::Short), 2);
        assert_eq!(size_of(TypeTag::Float), 4);
        assert_eq!(size_of(TypeTag::Long), 8);
        assert_eq!(<f64 as Element>::TAG.size_of(), std::mem::size_of::<f64>());
    }

    #[test]
    fn codes_match_stored_values() {
        assert_eq!(TypeTag::String.code(), 333);
        assert_eq!(TypeTag::from_code(700), Some(TypeTag::Float));
        assert_eq!(TypeTag::from_code(701), None);
    }
}
