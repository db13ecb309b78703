//! Field-level diff with type-aware equality.

use std::borrow::Cow;

use crate::{EntityField, FieldValue, Record};

/// Fields of `new` that really changed, plus `force_include`. Timestamps
/// compare by calendar date and text compares trimmed.
pub fn diff<F: EntityField>(
    old: Option<&Record<F>>,
    new: &Record<F>,
    force_include: &[F],
) -> Record<F> {
    let mut changes = Record::new();

    for (&field, new_value) in new {
        let old_value = old
            .and_then(|record| record.get(&field))
            .unwrap_or(&FieldValue::Null);
        let (old_value, new_value) = normalize_temporal(old_value, new_value);

        let changed = match (old_value.as_ref(), new_value.as_ref()) {
            (FieldValue::Text(o), FieldValue::Text(n)) => o.trim() != n.trim(),
            (o, n) => o != n,
        };

        if changed || force_include.contains(&field) {
            changes.insert(field, new_value.into_owned());
        }
    }

    changes
}

pub fn apply<F: EntityField>(base: &Record<F>, changes: &Record<F>) -> Record<F> {
    let mut merged = base.clone();
    merged.extend(changes.iter().map(|(field, value)| (*field, value.clone())));
    merged
}

/// True when `changes` touches anything besides the level's anchor fields.
pub fn has_real_change<F: EntityField>(changes: &Record<F>, anchors: &[F]) -> bool {
    changes.keys().any(|field| !anchors.contains(field))
}

fn normalize_temporal<'a>(
    old: &'a FieldValue,
    new: &'a FieldValue,
) -> (Cow<'a, FieldValue>, Cow<'a, FieldValue>) {
    let either_timestamp =
        matches!(old, FieldValue::Timestamp(_)) || matches!(new, FieldValue::Timestamp(_));
    if either_timestamp {
        (truncate_to_date(old), truncate_to_date(new))
    } else {
        (Cow::Borrowed(old), Cow::Borrowed(new))
    }
}

fn truncate_to_date(value: &FieldValue) -> Cow<'_, FieldValue> {
    match value {
        FieldValue::Timestamp(ts) => Cow::Owned(FieldValue::Date(ts.date())),
        other => Cow::Borrowed(other),
    }
}
