//! Local filtering, search, sorting and pagination over JSON documents.
//!
//! Used to answer list queries from the local store without a network
//! round trip, and by [`crate::remote::MemoryRemoteStore`] to evaluate
//! queries.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::paths::get_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    Gt,
    Lt,
    /// Inclusive range `value..=value2`
    Between,
}

/// One predicate over a dot-path field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<Value>,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            value2: None,
        }
    }

    pub fn between(field: impl Into<String>, low: Value, high: Value) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Between,
            value: low,
            value2: Some(high),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        let Some(value) = get_path(document, &self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::Equals => value == &self.value,
            FilterOperator::Contains => as_text(value).contains(&as_text(&self.value)),
            FilterOperator::StartsWith => as_text(value).starts_with(&as_text(&self.value)),
            FilterOperator::Gt => compare_values(value, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare_values(value, &self.value) == Some(Ordering::Less),
            FilterOperator::Between => {
                let Some(high) = &self.value2 else {
                    return false;
                };
                matches!(
                    compare_values(value, &self.value),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare_values(value, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Order two JSON scalars of the same kind. Mixed kinds are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Documents satisfying every condition. No conditions keeps everything.
pub fn filter<'a>(documents: &'a [Value], conditions: &[FilterCondition]) -> Vec<&'a Value> {
    documents
        .iter()
        .filter(|document| conditions.iter().all(|condition| condition.matches(document)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub query: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Documents where any of `options.fields` contains the query text.
pub fn search<'a>(documents: Vec<&'a Value>, options: &SearchOptions) -> Vec<&'a Value> {
    if options.query.is_empty() || options.fields.is_empty() {
        return documents;
    }
    let needle = if options.case_sensitive {
        options.query.clone()
    } else {
        options.query.to_lowercase()
    };

    documents
        .into_iter()
        .filter(|document| {
            options.fields.iter().any(|field| match get_path(document, field) {
                None | Some(Value::Null) => false,
                Some(value) => {
                    let text = as_text(value);
                    if options.case_sensitive {
                        text.contains(&needle)
                    } else {
                        text.to_lowercase().contains(&needle)
                    }
                }
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Order two documents by `field`. Documents missing the field sort after
/// those that have it in either direction.
pub fn compare_field(a: &Value, b: &Value, field: &str, order: SortOrder) -> Ordering {
    let a = get_path(a, field).filter(|value| !value.is_null());
    let b = get_path(b, field).filter(|value| !value.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ordering = compare_values(a, b).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        }
    }
}

/// Stable sort by `field`.
pub fn sort<'a>(mut documents: Vec<&'a Value>, field: &str, order: SortOrder) -> Vec<&'a Value> {
    documents.sort_by(|a, b| compare_field(a, b, field, order));
    documents
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based page number
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_more: bool,
}

/// Slice `items` into 1-based page `page`.
pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Page<T> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let total = items.len();
    let total_pages = total.div_ceil(page_size);
    let start = (page - 1).saturating_mul(page_size).min(total);
    let items: Vec<T> = items.into_iter().skip(start).take(page_size).collect();
    Page {
        has_more: start + items.len() < total,
        items,
        page,
        page_size,
        total,
        total_pages,
    }
}

/// Combined query: filter, then search, then sort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    pub filters: Vec<FilterCondition>,
    pub search: Option<SearchOptions>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
}

pub fn process<'a>(documents: &'a [Value], options: &QueryOptions) -> Vec<&'a Value> {
    let mut result = filter(documents, &options.filters);
    if let Some(search_options) = &options.search {
        result = search(result, search_options);
    }
    if let Some(field) = &options.sort_by {
        result = sort(result, field, options.sort_order);
    }
    result
}

/// Distinct non-null values of `field`, in first-seen order.
pub fn unique_values(documents: &[Value], field: &str) -> Vec<Value> {
    let mut values: Vec<Value> = Vec::new();
    for value in documents.iter().filter_map(|document| get_path(document, field)) {
        if !value.is_null() && !values.contains(value) {
            values.push(value.clone());
        }
    }
    values
}
