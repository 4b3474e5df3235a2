//! Reference-schema traversal and merging
//!
//! Interleaved mode compresses nested documents against a reference
//! document that fixes the field skeleton. These pure functions decide
//! whether an appended document fits the reference (with missing leaves
//! allowed) and grow the reference by structural merging while it is still
//! being determined.

use crate::types::{Document, Value};

/// Walk `reference` and `obj` in lock step.
///
/// The callback fires once per non-document reference leaf, in pre-order,
/// with the matching `obj` leaf or `None` when `obj` omits it. Returns true
/// iff the hierarchies are compatible: `obj`'s fields appear in reference
/// order, sub-documents line up with sub-documents, empty documents only
/// match empty documents, and `obj` has no fields the reference lacks.
///
/// The two input lifetimes are deliberately distinct so collected `obj`
/// leaves do not pin the reference borrow.
pub(crate) fn traverse_lock_step<'r, 'o, F>(
    reference: &'r Document,
    obj: &'o Document,
    mut f: F,
) -> bool
where
    F: FnMut(&'r Value, Option<&'o Value>),
{
    lock_step(reference, obj, &mut f)
}

fn lock_step<'r, 'o, F>(reference: &'r Document, obj: &'o Document, f: &mut F) -> bool
where
    F: FnMut(&'r Value, Option<&'o Value>),
{
    let fields = obj.fields();
    let mut pos = 0usize;

    for (name, ref_value) in reference.iter() {
        match ref_value {
            Value::Document(ref_sub) => {
                let current = fields.get(pos);
                // An empty reference sub-document has no leaves, so a row
                // cannot mark it missing with skips.
                if current.is_none() && ref_sub.is_empty() {
                    return false;
                }

                if current.map_or(false, |(n, _)| n == name) {
                    let (_, value) = &fields[pos];
                    let Value::Document(sub) = value else {
                        return false;
                    };
                    if ref_sub.is_empty() != sub.is_empty() {
                        return false;
                    }
                    pos += 1;
                    if !lock_step(ref_sub, sub, f) {
                        return false;
                    }
                } else {
                    // Assume the field at `pos` comes later in the
                    // reference and treat this subtree as missing. A real
                    // mismatch surfaces as leftover fields at the end.
                    traverse_missing(ref_sub, f);
                }
            }
            _ => {
                if fields.get(pos).map_or(false, |(n, _)| n == name) {
                    f(ref_value, Some(&fields[pos].1));
                    pos += 1;
                } else {
                    f(ref_value, None);
                }
            }
        }
    }

    // Fields of `obj` beyond the reference cannot be encoded.
    pos == fields.len()
}

/// Pre-order walk of a reference subtree whose counterpart is missing
fn traverse_missing<'r, 'o, F>(reference: &'r Document, f: &mut F)
where
    F: FnMut(&'r Value, Option<&'o Value>),
{
    for (_, value) in reference.iter() {
        if let Value::Document(sub) = value {
            traverse_missing(sub, f);
        } else {
            f(value, None);
        }
    }
}

/// Merge `obj`'s fields into `reference`, preserving reference order and
/// slotting new fields into consistent positions. Returns `None` when the
/// two cannot share a schema: incompatible nesting, empty/non-empty
/// sub-document mismatch, or an ordering that would emit a field twice.
/// Quadratic in field count; callers bound it with the buffering heuristic.
pub(crate) fn merge_documents(reference: &Document, obj: &Document) -> Option<Document> {
    let mut merged = Document::new();
    if merge_into(&mut merged, reference, obj) {
        Some(merged)
    } else {
        None
    }
}

fn merge_into(out: &mut Document, reference: &Document, obj: &Document) -> bool {
    let ref_fields = reference.fields();
    let obj_fields = obj.fields();
    let mut r = 0usize;
    let mut o = 0usize;

    while r < ref_fields.len() && o < obj_fields.len() {
        let (ref_name, ref_value) = &ref_fields[r];
        let (obj_name, obj_value) = &obj_fields[o];

        if ref_name == obj_name {
            match (ref_value, obj_value) {
                (Value::Document(ref_sub), Value::Document(obj_sub)) => {
                    if ref_sub.is_empty() != obj_sub.is_empty() {
                        return false;
                    }
                    let mut sub = Document::new();
                    if !merge_into(&mut sub, ref_sub, obj_sub) {
                        return false;
                    }
                    out.insert(ref_name.clone(), Value::Document(sub));
                }
                // Both sides must agree on document-ness to merge
                (Value::Document(_), _) | (_, Value::Document(_)) => return false,
                _ => out.insert(ref_name.clone(), ref_value.clone()),
            }
            r += 1;
            o += 1;
            continue;
        }

        // Names differ. If the reference field shows up later in `obj`,
        // emit the unseen obj field first; otherwise the reference field
        // goes first.
        if obj_fields[o + 1..].iter().any(|(n, _)| n == ref_name) {
            if out.contains_field(obj_name) {
                return false;
            }
            out.insert(obj_name.clone(), obj_value.clone());
            o += 1;
        } else {
            out.insert(ref_name.clone(), ref_value.clone());
            r += 1;
        }
    }

    for (name, value) in &ref_fields[r..] {
        if matches!(value, Value::Document(d) if d.is_empty()) {
            return false;
        }
        if out.contains_field(name) {
            return false;
        }
        out.insert(name.clone(), value.clone());
    }
    for (name, value) in &obj_fields[o..] {
        if matches!(value, Value::Document(d) if d.is_empty()) {
            return false;
        }
        if out.contains_field(name) {
            return false;
        }
        out.insert(name.clone(), value.clone());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, i32)]) -> Document {
        let mut doc = Document::new();
        for (name, value) in pairs {
            doc.insert(*name, *value);
        }
        doc
    }

    fn collect_leaves<'o>(reference: &Document, obj: &'o Document) -> Option<Vec<Option<&'o Value>>> {
        let mut leaves = Vec::new();
        traverse_lock_step(reference, obj, |_, leaf| leaves.push(leaf)).then_some(leaves)
    }

    #[test]
    fn test_traverse_reference_against_itself() {
        let reference = Document::new()
            .with_field("a", 1i32)
            .with_field(
                "sub",
                Document::new().with_field("x", 2i32).with_field("y", 3i32),
            )
            .with_field("b", 4i32);

        let leaves = collect_leaves(&reference, &reference).unwrap();
        assert_eq!(leaves.len(), 4);
        assert!(leaves.iter().all(Option::is_some));
    }

    #[test]
    fn test_traverse_missing_leaves_report_none() {
        let reference = doc(&[("a", 1), ("b", 2), ("c", 3)]);
        let obj = doc(&[("b", 9)]);

        let leaves = collect_leaves(&reference, &obj).unwrap();
        assert_eq!(leaves, vec![None, Some(&Value::Int32(9)), None]);
    }

    #[test]
    fn test_traverse_missing_subtree() {
        let reference = Document::new()
            .with_field("sub", Document::new().with_field("x", 1i32))
            .with_field("b", 2i32);
        let obj = doc(&[("b", 5)]);

        let leaves = collect_leaves(&reference, &obj).unwrap();
        assert_eq!(leaves, vec![None, Some(&Value::Int32(5))]);
    }

    #[test]
    fn test_traverse_rejects_extra_and_reordered_fields() {
        let reference = doc(&[("a", 1), ("b", 2)]);
        assert!(collect_leaves(&reference, &doc(&[("a", 1), ("b", 2), ("c", 3)])).is_none());
        assert!(collect_leaves(&reference, &doc(&[("b", 2), ("a", 1)])).is_none());
    }

    #[test]
    fn test_traverse_rejects_shape_mismatch() {
        let reference = Document::new().with_field("a", Document::new().with_field("x", 1i32));
        // document leaf vs scalar leaf
        assert!(collect_leaves(&reference, &doc(&[("a", 1)])).is_none());

        // empty vs non-empty sub-document
        let empty_sub = Document::new().with_field("a", Document::new());
        let nonempty = Document::new().with_field("a", Document::new().with_field("x", 1i32));
        assert!(collect_leaves(&empty_sub, &nonempty).is_none());

        // an empty reference sub-document cannot be missing
        assert!(collect_leaves(&empty_sub, &Document::new()).is_none());
    }

    #[test]
    fn test_merge_interleaves_new_fields() {
        let reference = doc(&[("a", 1), ("c", 3)]);
        let obj = doc(&[("a", 1), ("b", 2), ("c", 3)]);

        let merged = merge_documents(&reference, &obj).unwrap();
        let names: Vec<_> = merged.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // leaf values come from the reference side when both carry a field
        assert_eq!(merged.get("a"), Some(&Value::Int32(1)));
    }

    #[test]
    fn test_merge_appends_reference_only_and_obj_only_fields() {
        let merged = merge_documents(&doc(&[("a", 1), ("b", 2)]), &doc(&[("a", 9), ("c", 3)]))
            .unwrap();
        let names: Vec<_> = merged.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_acceptance_is_symmetric_for_disjoint_tails() {
        let left = merge_documents(&doc(&[("a", 1), ("b", 2)]), &doc(&[("a", 1), ("c", 3)]));
        let right = merge_documents(&doc(&[("a", 1), ("c", 3)]), &doc(&[("a", 1), ("b", 2)]));
        assert!(left.is_some());
        assert!(right.is_some());
    }

    #[test]
    fn test_merge_fails_on_reordered_fields() {
        let reference = doc(&[("a", 1), ("b", 2), ("c", 3)]);
        assert!(merge_documents(&reference, &doc(&[("b", 2), ("a", 1)])).is_none());
    }

    #[test]
    fn test_merge_fails_on_nesting_conflict() {
        let reference = Document::new().with_field("a", Document::new().with_field("x", 1i32));
        assert!(merge_documents(&reference, &doc(&[("a", 1)])).is_none());
    }

    #[test]
    fn test_merge_fails_on_trailing_empty_document() {
        let reference = Document::new()
            .with_field("a", 1i32)
            .with_field("e", Document::new());
        assert!(merge_documents(&reference, &doc(&[("a", 1)])).is_none());
    }

    #[test]
    fn test_merge_recurses_into_matching_subdocuments() {
        let reference = Document::new()
            .with_field("s", Document::new().with_field("x", 1i32))
            .with_field("z", 2i32);
        let obj = Document::new().with_field(
            "s",
            Document::new().with_field("x", 1i32).with_field("y", 2i32),
        );

        let merged = merge_documents(&reference, &obj).unwrap();
        let Some(Value::Document(sub)) = merged.get("s") else {
            panic!("merged sub-document missing");
        };
        let names: Vec<_> = sub.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(merged.contains_field("z"));
    }
}
