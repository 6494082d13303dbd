use std::fmt;

use flounder_error::{FlounderError, Result};
use serde::{Deserialize, Serialize};

/// Type category of a SQL value.
///
/// The discriminant order encodes implicit-cast precedence: when a binary
/// expression mixes categories, the lower-precedence operand is cast to the
/// higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    /// Variable-length string (lowest precedence).
    Varchar = 0,
    /// Fixed-length string.
    Char = 1,
    /// Boolean stored as one byte.
    Bool = 2,
    /// 32-bit signed integer.
    Int = 3,
    /// 64-bit signed integer.
    Bigint = 4,
    /// Fixed-point decimal stored as a scaled i64.
    Decimal = 5,
    /// 64-bit IEEE 754 float.
    Float = 6,
    /// Date encoded as `yyyy * 10000 + mm * 100 + dd` (highest precedence).
    Date = 7,
    /// No type (undefined sentinel).
    Nt = 8,
}

impl TypeTag {
    /// Display name used in schema output and error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Varchar => "VARCHAR",
            Self::Char => "CHAR",
            Self::Bool => "BOOL",
            Self::Int => "INT",
            Self::Bigint => "BIGINT",
            Self::Decimal => "DECIMAL",
            Self::Float => "FLOAT",
            Self::Date => "DATE",
            Self::Nt => "",
        }
    }
}

/// A concrete SQL type: tag plus parameters for the parameterized tags.
///
/// Two decimals are equal iff both precision and scale match; char and
/// varchar compare by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlType {
    pub tag: TypeTag,
    /// Decimal precision; 0 for other tags.
    pub precision: u8,
    /// Decimal scale; 0 for other tags.
    pub scale: u8,
    /// Char/varchar length; 0 for other tags.
    pub len: usize,
}

impl SqlType {
    pub const NT: Self = Self::plain(TypeTag::Nt);

    const fn plain(tag: TypeTag) -> Self {
        Self {
            tag,
            precision: 0,
            scale: 0,
            len: 0,
        }
    }

    pub const fn int() -> Self {
        Self::plain(TypeTag::Int)
    }

    pub const fn bigint() -> Self {
        Self::plain(TypeTag::Bigint)
    }

    pub const fn date() -> Self {
        Self::plain(TypeTag::Date)
    }

    pub const fn bool() -> Self {
        Self::plain(TypeTag::Bool)
    }

    pub const fn float() -> Self {
        Self::plain(TypeTag::Float)
    }

    pub const fn decimal(precision: u8, scale: u8) -> Self {
        Self {
            tag: TypeTag::Decimal,
            precision,
            scale,
            len: 0,
        }
    }

    pub const fn char(len: usize) -> Self {
        Self {
            tag: TypeTag::Char,
            precision: 0,
            scale: 0,
            len,
        }
    }

    pub const fn varchar(len: usize) -> Self {
        Self {
            tag: TypeTag::Varchar,
            precision: 0,
            scale: 0,
            len,
        }
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self.tag, TypeTag::Nt)
    }

    pub const fn is_string(&self) -> bool {
        matches!(self.tag, TypeTag::Char | TypeTag::Varchar)
    }

    pub const fn is_numeric(&self) -> bool {
        matches!(
            self.tag,
            TypeTag::Int | TypeTag::Bigint | TypeTag::Decimal | TypeTag::Float
        )
    }

    /// Whether values of this type have a total order usable by comparisons
    /// and MIN/MAX.
    pub const fn is_ordered(&self) -> bool {
        matches!(
            self.tag,
            TypeTag::Int | TypeTag::Bigint | TypeTag::Decimal | TypeTag::Float | TypeTag::Date
        )
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag.name())?;
        match self.tag {
            TypeTag::Decimal => write!(f, "({},{})", self.precision, self.scale),
            TypeTag::Char | TypeTag::Varchar => write!(f, "({})", self.len),
            _ => Ok(()),
        }
    }
}

/// Bytes an attribute of type `t` occupies inside a tuple.
///
/// Inline string storage always reserves `len + 1` bytes for the NUL
/// terminator; by-reference storage reserves 8 bytes for the pointer.
/// CHAR(1) is stored inline in both modes (value byte + terminator).
pub fn size_in_tuple(t: SqlType, strings_by_val: bool) -> Result<usize> {
    match t.tag {
        TypeTag::Bool => Ok(1),
        TypeTag::Date | TypeTag::Int => Ok(4),
        TypeTag::Bigint | TypeTag::Decimal | TypeTag::Float => Ok(8),
        TypeTag::Char => {
            if t.len == 1 {
                Ok(2)
            } else if strings_by_val {
                Ok(t.len + 1)
            } else {
                Ok(8)
            }
        }
        TypeTag::Varchar => {
            if strings_by_val {
                Ok(t.len + 1)
            } else {
                Ok(8)
            }
        }
        TypeTag::Nt => Err(FlounderError::internal(
            "size_in_tuple for undefined type".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_order() {
        assert!(TypeTag::Date > TypeTag::Decimal);
        assert!(TypeTag::Decimal > TypeTag::Bigint);
        assert!(TypeTag::Bigint > TypeTag::Int);
        assert!(TypeTag::Varchar < TypeTag::Char);
    }

    #[test]
    fn decimal_equality_needs_both_parameters() {
        assert_eq!(SqlType::decimal(5, 2), SqlType::decimal(5, 2));
        assert_ne!(SqlType::decimal(5, 2), SqlType::decimal(5, 1));
        assert_ne!(SqlType::decimal(6, 2), SqlType::decimal(5, 2));
    }

    #[test]
    fn display_forms() {
        assert_eq!(SqlType::decimal(19, 4).to_string(), "DECIMAL(19,4)");
        assert_eq!(SqlType::varchar(25).to_string(), "VARCHAR(25)");
        assert_eq!(SqlType::bigint().to_string(), "BIGINT");
    }

    #[test]
    fn tuple_sizes() {
        assert_eq!(size_in_tuple(SqlType::bool(), true).unwrap(), 1);
        assert_eq!(size_in_tuple(SqlType::date(), true).unwrap(), 4);
        assert_eq!(size_in_tuple(SqlType::bigint(), true).unwrap(), 8);
        // inline strings reserve the terminator
        assert_eq!(size_in_tuple(SqlType::varchar(10), true).unwrap(), 11);
        assert_eq!(size_in_tuple(SqlType::varchar(10), false).unwrap(), 8);
        assert_eq!(size_in_tuple(SqlType::char(1), false).unwrap(), 2);
        assert!(size_in_tuple(SqlType::NT, true).is_err());
    }
}
