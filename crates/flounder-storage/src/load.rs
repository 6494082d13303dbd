use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flounder_error::{FlounderError, Result};
use flounder_types::{parse_value, size_in_tuple, value_to_address, Schema};

use crate::relation::Relation;

/// Load a relation from a delimited text file: one tuple per line, fields
/// separated by a single-character terminator, values parsed per the
/// destination attribute's type.
pub fn relation_from_file(schema: Schema, path: &Path, terminator: char) -> Result<Relation> {
    let file = File::open(path).map_err(|_| FlounderError::CannotOpen {
        path: path.display().to_string(),
    })?;
    let mut rel = Relation::new(schema)?;
    let file_name = path.display().to_string();

    let mut offsets = Vec::with_capacity(rel.schema.len());
    let mut offset = 0usize;
    for att in &rel.schema.attributes {
        offsets.push(offset);
        offset += size_in_tuple(att.ty, rel.schema.strings_by_val)?;
    }

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let tuple = rel.append_tuple();
        let mut fields = line.split(terminator);
        for (idx, (att, att_offset)) in rel
            .schema
            .attributes
            .iter()
            .zip(offsets.iter())
            .enumerate()
        {
            let token = fields.next().ok_or_else(|| FlounderError::BulkLoad {
                file: file_name.clone(),
                line: line_no + 1,
                detail: format!("missing field {}", idx + 1),
            })?;
            let (val, _, _buf) =
                parse_value(token, att.ty.tag).map_err(|e| FlounderError::BulkLoad {
                    file: file_name.clone(),
                    line: line_no + 1,
                    detail: e.to_string(),
                })?;
            unsafe { value_to_address(tuple.add(*att_offset), val, att.ty) };
        }
        if fields.next().is_some() {
            return Err(FlounderError::BulkLoad {
                file: file_name,
                line: line_no + 1,
                detail: "extra fields".to_owned(),
            });
        }
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flounder_types::{value_from_address, Attribute, SqlType};
    use std::io::Write;

    #[test]
    fn loads_mixed_types() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1,999.9,1998-09-02,true").unwrap();
        writeln!(f, "2,1000.0,1998-09-03,false").unwrap();
        let schema = Schema::new(
            vec![
                Attribute {
                    name: "k".into(),
                    ty: SqlType::bigint(),
                },
                Attribute {
                    name: "q".into(),
                    ty: SqlType::decimal(5, 1),
                },
                Attribute {
                    name: "d".into(),
                    ty: SqlType::date(),
                },
                Attribute {
                    name: "b".into(),
                    ty: SqlType::bool(),
                },
            ],
            true,
        )
        .unwrap();
        let rel = relation_from_file(schema, f.path(), ',').unwrap();
        assert_eq!(rel.tuple_count(), 2);

        let mut rows = Vec::new();
        rel.for_each_tuple(|t| unsafe {
            let k = value_from_address(SqlType::bigint(), t).as_i64();
            let q = value_from_address(SqlType::decimal(5, 1), t.add(8)).as_i64();
            let d = value_from_address(SqlType::date(), t.add(16)).as_u32();
            let b = value_from_address(SqlType::bool(), t.add(20)).as_bool();
            rows.push((k, q, d, b));
        });
        assert_eq!(
            rows,
            vec![(1, 9999, 19980902, true), (2, 10000, 19980903, false)]
        );
    }

    #[test]
    fn missing_field_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "1").unwrap();
        let schema = Schema::new(
            vec![
                Attribute {
                    name: "a".into(),
                    ty: SqlType::bigint(),
                },
                Attribute {
                    name: "b".into(),
                    ty: SqlType::bigint(),
                },
            ],
            true,
        )
        .unwrap();
        assert!(relation_from_file(schema, f.path(), ',').is_err());
    }
}
