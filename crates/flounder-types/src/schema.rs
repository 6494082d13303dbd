use std::collections::BTreeSet;

use flounder_error::{FlounderError, Result};
use serde::{Deserialize, Serialize};

use crate::types::{size_in_tuple, SqlType};

/// A set of symbol (attribute / expression) names.
///
/// Ordered so request sets and schema pruning are deterministic.
pub type SymbolSet = BTreeSet<String>;

pub fn symbol_set_union(a: &SymbolSet, b: &SymbolSet) -> SymbolSet {
    a.union(b).cloned().collect()
}

/// A named, typed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub ty: SqlType,
}

/// An ordered attribute list with derived tuple layout.
///
/// `strings_by_val` selects between storing string bytes inline (with NUL
/// terminator) and storing an 8-byte pointer; it changes every offset, so a
/// schema is always constructed for one specific mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub attributes: Vec<Attribute>,
    pub strings_by_val: bool,
    pub tuple_size: usize,
}

impl Schema {
    pub fn new(attributes: Vec<Attribute>, strings_by_val: bool) -> Result<Self> {
        let mut tuple_size = 0;
        for att in &attributes {
            tuple_size += size_in_tuple(att.ty, strings_by_val)?;
        }
        Ok(Self {
            attributes,
            strings_by_val,
            tuple_size,
        })
    }

    /// Rebuild this schema's layout for a different string-storage mode.
    pub fn with_string_mode(&self, strings_by_val: bool) -> Result<Self> {
        Self::new(self.attributes.clone(), strings_by_val)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Byte offset of an attribute within a tuple.
    pub fn offset_of(&self, name: &str) -> Result<usize> {
        let mut offset = 0;
        for att in &self.attributes {
            if att.name == name {
                return Ok(offset);
            }
            offset += size_in_tuple(att.ty, self.strings_by_val)?;
        }
        Err(FlounderError::NoSuchAttribute {
            name: name.to_owned(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| FlounderError::NoSuchAttribute {
                name: name.to_owned(),
            })
    }

    pub fn type_of(&self, name: &str) -> Result<SqlType> {
        Ok(self.attribute(name)?.ty)
    }

    /// Keep only the attributes named in `required`, preserving order.
    pub fn prune(&self, required: &SymbolSet) -> Result<Self> {
        let kept = self
            .attributes
            .iter()
            .filter(|a| required.contains(&a.name))
            .cloned()
            .collect();
        Self::new(kept, self.strings_by_val)
    }

    /// Concatenate the attributes of `self` and `other`.
    pub fn join(&self, other: &Schema) -> Result<Self> {
        let mut attributes = self.attributes.clone();
        attributes.extend(other.attributes.iter().cloned());
        Self::new(attributes, self.strings_by_val)
    }

    pub fn symbols(&self) -> SymbolSet {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }
}
