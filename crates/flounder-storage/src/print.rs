use std::fmt::Write as _;

use flounder_types::{serialize_value, size_in_tuple, value_from_address};

use crate::relation::Relation;

fn print_table_line(out: &mut String, l: &str, m: &str, x: &str, r: &str, widths: &[usize]) {
    out.push_str(l);
    for (i, w) in widths.iter().enumerate() {
        if i > 0 {
            out.push_str(x);
        }
        for _ in 0..*w {
            out.push_str(m);
        }
    }
    out.push_str(r);
    out.push('\n');
}

fn print_table_row(out: &mut String, cells: &[String], widths: &[usize]) {
    for (cell, w) in cells.iter().zip(widths) {
        let _ = write!(out, "│{:>width$}", format!(" {} ", cell), width = w);
    }
    out.push_str("│\n");
}

/// Render a string table with box-drawing borders. `cells` is row-major with
/// `columns` entries per row; the first `header_rows` rows are separated from
/// the body.
pub fn print_string_table(
    cells: &[String],
    columns: usize,
    header_rows: usize,
    subtitle: &str,
    max_width: usize,
    open_end: bool,
) -> String {
    let mut cells: Vec<String> = cells.to_vec();
    if max_width > 0 {
        for cell in &mut cells {
            if cell.len() > max_width {
                cell.truncate(max_width);
                cell.push_str("..");
            }
        }
    }
    let mut widths = vec![0usize; columns];
    for (i, cell) in cells.iter().enumerate() {
        widths[i % columns] = widths[i % columns].max(cell.len() + 2);
    }

    let mut out = String::new();
    print_table_line(&mut out, "┌", "─", "┬", "┐", &widths);
    let mut idx = 0;
    for _ in 0..header_rows {
        if idx + columns <= cells.len() {
            print_table_row(&mut out, &cells[idx..idx + columns], &widths);
            idx += columns;
        }
    }
    print_table_line(&mut out, "├", "─", "┼", "┤", &widths);
    while idx + columns <= cells.len() {
        print_table_row(&mut out, &cells[idx..idx + columns], &widths);
        idx += columns;
    }
    if open_end {
        let dots: Vec<String> = (0..columns).map(|_| "...".to_owned()).collect();
        print_table_row(&mut out, &dots, &widths);
    }
    print_table_line(&mut out, "└", "─", "┴", "┘", &widths);
    if !subtitle.is_empty() {
        let table_width: usize = widths.iter().sum::<usize>() + columns;
        let _ = writeln!(out, "{subtitle:>table_width$}");
    }
    out
}

/// Render a relation: attribute names, types, and up to `limit` rows.
pub fn print_relation(rel: &Relation) -> String {
    const LIMIT: usize = 18;
    const MAX_WIDTH: usize = 25;

    let n_atts = rel.schema.len();
    if n_atts == 0 {
        return "Relation with no attributes.\n".to_owned();
    }
    let mut cells = Vec::new();
    for att in &rel.schema.attributes {
        cells.push(att.name.clone());
    }
    for att in &rel.schema.attributes {
        cells.push(att.ty.to_string());
    }

    let mut offsets = Vec::with_capacity(n_atts);
    let mut offset = 0usize;
    for att in &rel.schema.attributes {
        offsets.push(offset);
        offset += size_in_tuple(att.ty, rel.schema.strings_by_val).unwrap_or(8);
    }

    let mut n = 0usize;
    rel.for_each_tuple(|tuple| {
        if n >= LIMIT {
            n += 1;
            return;
        }
        for (att, off) in rel.schema.attributes.iter().zip(&offsets) {
            let val = unsafe { value_from_address(att.ty, tuple.add(*off)) };
            cells.push(serialize_value(val, att.ty));
        }
        n += 1;
    });

    let subtitle = format!("{} tuples", rel.tuple_count());
    print_string_table(
        &cells,
        n_atts,
        2,
        &subtitle,
        MAX_WIDTH,
        rel.tuple_count() > LIMIT,
    )
}

/// Write a relation in delimited form, one tuple per line.
pub fn serialize_relation(rel: &Relation, separator: &str) -> String {
    let mut offsets = Vec::with_capacity(rel.schema.len());
    let mut offset = 0usize;
    for att in &rel.schema.attributes {
        offsets.push(offset);
        offset += size_in_tuple(att.ty, rel.schema.strings_by_val).unwrap_or(8);
    }
    let mut out = String::new();
    rel.for_each_tuple(|tuple| {
        for (att, off) in rel.schema.attributes.iter().zip(&offsets) {
            let val = unsafe { value_from_address(att.ty, tuple.add(*off)) };
            out.push_str(&serialize_value(val, att.ty));
            out.push_str(separator);
        }
        out.push('\n');
    });
    out
}
