use std::collections::BTreeMap;

use flounder_error::{FlounderError, Result};
use flounder_types::SqlType;

use crate::relation::Relation;

/// The table catalog: a mapping from table name to relation.
///
/// Relations are boxed so their addresses stay stable while compiled queries
/// hold pointers into them.
#[derive(Debug, Default)]
pub struct Database {
    relations: BTreeMap<String, Box<Relation>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn insert(&mut self, name: String, rel: Relation) -> Result<()> {
        if self.relations.contains_key(&name) {
            return Err(FlounderError::TableExists { name });
        }
        self.relations.insert(name, Box::new(rel));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Relation> {
        self.relations
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| FlounderError::NoSuchTable {
                name: name.to_owned(),
            })
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Relation> {
        self.relations
            .get_mut(name)
            .map(|b| b.as_mut())
            .ok_or_else(|| FlounderError::NoSuchTable {
                name: name.to_owned(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Relation)> {
        self.relations.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// All attribute name → type bindings across the catalog, for type
    /// derivation.
    pub fn identifier_types(&self) -> BTreeMap<String, SqlType> {
        let mut res = BTreeMap::new();
        for (_, rel) in self.iter() {
            for att in &rel.schema.attributes {
                res.insert(att.name.clone(), att.ty);
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flounder_types::{Attribute, Schema};

    #[test]
    fn insert_and_lookup() {
        let mut db = Database::new();
        let schema = Schema::new(
            vec![Attribute {
                name: "a".into(),
                ty: SqlType::bigint(),
            }],
            true,
        )
        .unwrap();
        db.insert("r".into(), Relation::new(schema.clone()).unwrap())
            .unwrap();
        assert!(db.contains("r"));
        assert!(db.get("r").is_ok());
        assert!(db.get("s").is_err());
        assert!(db
            .insert("r".into(), Relation::new(schema).unwrap())
            .is_err());
        assert_eq!(db.identifier_types().get("a"), Some(&SqlType::bigint()));
    }
}
