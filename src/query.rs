use crate::errors::{AppError, AppResult};
use crate::models::{FieldFilter, OrderBy, Page, PageRequest, Query, Record, SortDirection};
use crate::store::{validate_field_name, ScanOptions, StoreAdapter};
use serde_json::Value;
use std::cmp::Ordering;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub native: Option<FieldFilter>,
    pub residual: Vec<FieldFilter>,
    pub order: Option<OrderBy>,
    pub emulate_order: bool,
    pub limit: Option<usize>,
    pub push_down_limit: bool,
}

pub struct QueryPlanner;

impl QueryPlanner {
    pub fn plan(query: &Query) -> AppResult<QueryPlan> {
        for filter in &query.filters {
            if filter.field.is_empty() {
                return Err(AppError::Validation("filter field name is empty".to_string()));
            }
            validate_field_name(&filter.field)?;
        }
        if let Some(order) = &query.order {
            if order.field.is_empty() {
                return Err(AppError::Validation("order field name is empty".to_string()));
            }
            validate_field_name(&order.field)?;
        }
        if query.limit == Some(0) {
            return Err(AppError::Validation("limit must be at least 1".to_string()));
        }

        let mut filters = query.filters.iter().cloned();
        let native = filters.next();
        let residual: Vec<FieldFilter> = filters.collect();
        let emulate_order = query
            .order
            .as_ref()
            .map_or(false, |order| !order.is_key_ascending());

        Ok(QueryPlan {
            push_down_limit: query.limit.is_some() && residual.is_empty() && !emulate_order,
            native,
            residual,
            order: query.order.clone(),
            emulate_order,
            limit: query.limit,
        })
    }
}

pub async fn execute(store: &dyn StoreAdapter, path: &str, query: &Query) -> AppResult<Vec<Record>> {
    let plan = QueryPlanner::plan(query)?;
    run_plan(store, path, &plan).await
}

pub async fn run_plan(store: &dyn StoreAdapter, path: &str, plan: &QueryPlan) -> AppResult<Vec<Record>> {
    if plan.push_down_limit {
        let options = ScanOptions {
            equality: plan.native.clone(),
            order: plan.order.clone(),
            limit: plan.limit,
        };
        return store.scan(path, &options).await;
    }

    let scanned = store.scan_native(path, plan.native.as_ref()).await?;
    let mut records = apply_residual_filters(scanned, &plan.residual);
    if let Some(order) = plan.order.as_ref().filter(|_| plan.emulate_order) {
        sort_records(&mut records, order);
    }
    if let Some(limit) = plan.limit {
        records.truncate(limit);
    }
    tracing::trace!(
        path,
        native = plan.native.is_some(),
        residual = plan.residual.len(),
        emulated_order = plan.emulate_order,
        returned = records.len(),
        "query executed"
    );
    Ok(records)
}

pub async fn execute_page(
    store: &dyn StoreAdapter,
    path: &str,
    query: &Query,
    request: PageRequest,
) -> AppResult<Page<Record>> {
    let records = execute(store, path, query).await?;
    paginate(records, request.limit, request.cursor)
}

// Cursor is an offset into the fully filtered and sorted result.
pub fn paginate<T>(items: Vec<T>, limit: Option<u32>, cursor: Option<String>) -> AppResult<Page<T>> {
    let total = items.len();
    let offset = parse_cursor(cursor)?;
    let page_size = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE) as usize;

    let page_items: Vec<T> = items.into_iter().skip(offset).take(page_size).collect();
    let consumed = offset + page_items.len();
    let next_cursor = if consumed < total {
        Some(consumed.to_string())
    } else {
        None
    };

    Ok(Page {
        items: page_items,
        next_cursor,
        total_approx: Some(total as u64),
    })
}

fn parse_cursor(cursor: Option<String>) -> AppResult<usize> {
    let Some(value) = cursor else {
        return Ok(0);
    };
    value
        .parse::<usize>()
        .map_err(|_| AppError::Validation(format!("invalid cursor '{}': expected numeric offset", value)))
}

pub fn apply_residual_filters(records: Vec<Record>, filters: &[FieldFilter]) -> Vec<Record> {
    if filters.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| filters.iter().all(|filter| filter.matches(record)))
        .collect()
}

pub fn sort_records(records: &mut [Record], order: &OrderBy) {
    records.sort_by(|a, b| {
        let left = a.field_value(&order.field);
        let right = b.field_value(&order.field);
        let ordering = compare_values(
            left.as_deref().unwrap_or(&Value::Null),
            right.as_deref().unwrap_or(&Value::Null),
        );
        let ordering = match order.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    });
}

// null < bool < number < string < array < object.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
