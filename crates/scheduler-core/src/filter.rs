//! The in-memory filter/sort/paginate pass applied after `EntityStore`
//! returns a raw id/type match (spec §4.5.1). Pure and deterministic
//! (P10): same input array + same options always yields the same output.

use crate::entity::Entity;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Default)]
pub struct FilterSortPageOptions {
    /// Non-empty ⇒ drop items whose `data` is not a parsable object or
    /// fails any key equality (loose equality, see [`loose_eq`]).
    pub data_filter: Option<serde_json::Map<String, Value>>,
    /// Single field → direction. `None` defaults to `{createdAt: -1}`.
    pub sort_by: Option<(String, SortDirection)>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl From<i64> for SortDirection {
    fn from(v: i64) -> Self {
        if v < 0 {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }
}

const DEFAULT_LIMIT: usize = 100;

/// Loose equality used by `dataFilter`: values of different JSON types
/// compare equal when their string/number representations coincide
/// (spec §8 scenario 5: `"2" == 2`).
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b1), Value::String(s)) | (Value::String(s), Value::Bool(b1)) => {
            s == if *b1 { "true" } else { "false" }
        }
        _ => false,
    }
}

fn passes_data_filter(data: &Option<Value>, filter: &serde_json::Map<String, Value>) -> bool {
    let Some(Value::Object(obj)) = data else {
        return false;
    };
    filter.iter().all(|(k, expected)| match obj.get(k) {
        Some(actual) => loose_eq(actual, expected),
        None => false,
    })
}

fn field_value(entity: &Entity, data: &Option<Value>, field: &str) -> Value {
    if field == "createdAt" {
        return Value::String(entity.created_at.to_rfc3339());
    }
    data.as_ref()
        .and_then(|v| v.get(field))
        .cloned()
        .unwrap_or(Value::Null)
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Applies the filter, then the single-field stable sort (ties keep
/// input order — `Vec::sort_by` is a stable sort in Rust's standard
/// library, which is why it's used here rather than an unstable variant),
/// then the `[skip, skip+limit)` slice.
pub fn apply_filter_sort_page(items: Vec<Entity>, opts: &FilterSortPageOptions) -> Vec<Entity> {
    let mut with_data: Vec<(Entity, Option<Value>)> = items
        .into_iter()
        .map(|e| {
            let data = e.parsed_data();
            (e, data)
        })
        .collect();

    if let Some(filter) = opts.data_filter.as_ref().filter(|f| !f.is_empty()) {
        with_data.retain(|(_, data)| passes_data_filter(data, filter));
    }

    let (field, direction) = opts
        .sort_by
        .clone()
        .unwrap_or_else(|| ("createdAt".to_string(), SortDirection::Descending));

    with_data.sort_by(|(ea, da), (eb, db)| {
        let va = field_value(ea, da, &field);
        let vb = field_value(eb, db, &field);
        let ord = compare_values(&va, &vb);
        match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    });

    let skip = opts.skip.unwrap_or(0);
    let limit = opts.limit.unwrap_or(DEFAULT_LIMIT);
    with_data
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|(e, _)| e)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMetadata;
    use chrono::{TimeZone, Utc};

    fn entity(id: &str, data: Value, created_at_secs: i64) -> Entity {
        Entity {
            entity_id: id.to_string(),
            entity_type: "T".to_string(),
            data_blob: serde_json::to_vec(&data).unwrap(),
            metadata: EntityMetadata::default(),
            created_at: Utc.timestamp_opt(created_at_secs, 0).unwrap(),
            deleted_at: None,
        }
    }

    #[test]
    fn loose_equality_coerces_numbers_and_strings() {
        let middle_only = vec![
            entity("a", serde_json::json!({"k": 1}), 1),
            entity("b", serde_json::json!({"k": "2"}), 2),
            entity("c", serde_json::json!({"k": 3}), 3),
        ];
        let mut filter = serde_json::Map::new();
        filter.insert("k".to_string(), serde_json::json!(2));
        let opts = FilterSortPageOptions {
            data_filter: Some(filter),
            sort_by: Some(("createdAt".to_string(), SortDirection::Ascending)),
            limit: Some(10),
            skip: Some(0),
        };
        let result = apply_filter_sort_page(middle_only, &opts);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].entity_id, "b");
    }

    #[test]
    fn default_sort_is_created_at_descending() {
        let items = vec![
            entity("old", serde_json::json!({}), 1),
            entity("new", serde_json::json!({}), 2),
        ];
        let result = apply_filter_sort_page(items, &FilterSortPageOptions::default());
        assert_eq!(result[0].entity_id, "new");
        assert_eq!(result[1].entity_id, "old");
    }

    #[test]
    fn ties_preserve_input_order() {
        let items = vec![
            entity("first", serde_json::json!({"k": 1}), 5),
            entity("second", serde_json::json!({"k": 1}), 5),
        ];
        let opts = FilterSortPageOptions {
            sort_by: Some(("k".to_string(), SortDirection::Ascending)),
            ..Default::default()
        };
        let result = apply_filter_sort_page(items, &opts);
        assert_eq!(result[0].entity_id, "first");
        assert_eq!(result[1].entity_id, "second");
    }

    #[test]
    fn skip_and_limit_slice_the_sorted_output() {
        let items = (0..5)
            .map(|i| entity(&i.to_string(), serde_json::json!({}), i))
            .collect::<Vec<_>>();
        let opts = FilterSortPageOptions {
            sort_by: Some(("createdAt".to_string(), SortDirection::Ascending)),
            skip: Some(2),
            limit: Some(2),
            ..Default::default()
        };
        let result = apply_filter_sort_page(items, &opts);
        let ids: Vec<_> = result.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let items = vec![
            entity("a", serde_json::json!({"k": 1}), 1),
            entity("b", serde_json::json!({"k": 2}), 2),
        ];
        let opts = FilterSortPageOptions::default();
        let first = apply_filter_sort_page(items.clone(), &opts);
        let second = apply_filter_sort_page(items, &opts);
        let first_ids: Vec<_> = first.iter().map(|e| e.entity_id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|e| e.entity_id.clone()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
