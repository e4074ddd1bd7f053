//! Filtered reads: record pages, measure totals and filter options

use crate::error::{QueryError, StoreError};
use crate::record::{canonical_text, FilterField, Measure, Record, StoredRecord};
use crate::store::RecordStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const MAX_PAGE_SIZE: u64 = 1000;

// ============================================================================
// Filter
// ============================================================================

/// Allowed values per filterable field.
///
/// A field with no entry is unrestricted. Values are compared against the
/// canonical text of the record's field, so a numeric `branch` of 7 matches
/// the allowed value `"7"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    allowed: BTreeMap<FilterField, BTreeSet<String>>,
}

impl RecordFilter {
    /// Restrict `field` to `values`. An empty list leaves it unrestricted.
    pub fn allow<I, S>(mut self, field: FilterField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.allowed.remove(&field);
        } else {
            self.allowed.insert(field, values);
        }
        self
    }

    /// Build a filter from the dashboard's query parameters, each a JSON
    /// array. Entries are compared by canonical text, so `[7]` and `["7"]`
    /// are the same filter; null entries match nothing. Missing or blank
    /// parameters are unrestricted.
    pub fn from_params(
        categories: Option<&str>,
        branches: Option<&str>,
        suppliers: Option<&str>,
    ) -> Result<Self, QueryError> {
        let mut filter = RecordFilter::default();
        for (field, param, raw) in [
            (FilterField::Category, "categories", categories),
            (FilterField::Branch, "branches", branches),
            (FilterField::Supplier, "suppliers", suppliers),
        ] {
            let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let values: Vec<Value> =
                serde_json::from_str(raw).map_err(|source| QueryError::InvalidFilter {
                    param: param.to_string(),
                    source,
                })?;
            filter = filter.allow(field, values.iter().filter_map(canonical_text));
        }
        Ok(filter)
    }

    pub fn allowed(&self, field: FilterField) -> Option<&BTreeSet<String>> {
        self.allowed.get(&field)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.allowed.iter().all(|(field, values)| {
            record
                .filter_text(*field)
                .is_some_and(|text| values.contains(&text))
        })
    }
}

// ============================================================================
// Totals
// ============================================================================

/// Sum of each measure over a record set
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MeasureTotals {
    #[serde(rename = "totalNetSlsQty")]
    pub net_sls_qty: f64,
    #[serde(rename = "totalNetAmount")]
    pub net_amount: f64,
    #[serde(rename = "totalNetSlsCostValue")]
    pub net_sls_cost_value: f64,
    #[serde(rename = "totalSlsExtCostValue")]
    pub sls_ext_cost_value: f64,
}

impl MeasureTotals {
    fn slot(&mut self, measure: Measure) -> &mut f64 {
        match measure {
            Measure::NetSlsQty => &mut self.net_sls_qty,
            Measure::NetAmount => &mut self.net_amount,
            Measure::NetSlsCostValue => &mut self.net_sls_cost_value,
            Measure::SlsExtCostValue => &mut self.sls_ext_cost_value,
        }
    }

    pub fn get(&self, measure: Measure) -> f64 {
        match measure {
            Measure::NetSlsQty => self.net_sls_qty,
            Measure::NetAmount => self.net_amount,
            Measure::NetSlsCostValue => self.net_sls_cost_value,
            Measure::SlsExtCostValue => self.sls_ext_cost_value,
        }
    }

    /// Add one raw field value, coerced the same way consolidation does
    pub fn add(&mut self, measure: Measure, value: Option<&Value>) {
        *self.slot(measure) += crate::record::coerce_number(value);
    }

    pub fn add_record(&mut self, record: &Record) {
        for measure in Measure::ALL {
            *self.slot(measure) += record.measure(measure).as_f64();
        }
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// 1-indexed page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    /// Page and size below 1 are raised to 1
    pub fn new(page: u64, page_size: u64) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u64,
    pub total_pages: u64,
    pub page_size: u64,
    pub total_records: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl Pagination {
    pub fn new(request: PageRequest, total_records: u64) -> Self {
        let total_pages = total_records.div_ceil(request.page_size);
        Self {
            current_page: request.page,
            total_pages,
            page_size: request.page_size,
            total_records,
            has_next_page: request.page < total_pages,
            has_prev_page: request.page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    #[serde(rename = "data")]
    pub records: Vec<StoredRecord>,
    pub pagination: Pagination,
}

/// Sorted distinct values of each filterable field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterOptions {
    pub categories: Vec<String>,
    pub branches: Vec<String>,
    pub suppliers: Vec<String>,
}

// ============================================================================
// Query service
// ============================================================================

/// Read-side operations over a store
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn RecordStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn query_page(
        &self,
        filter: &RecordFilter,
        request: PageRequest,
    ) -> Result<RecordPage, StoreError> {
        let total = self.store.count(filter).await?;
        let records = self
            .store
            .find(filter, request.skip(), request.page_size)
            .await?;
        debug!(page = request.page, returned = records.len(), total, "queried page");

        Ok(RecordPage {
            records,
            pagination: Pagination::new(request, total),
        })
    }

    pub async fn query_totals(&self, filter: &RecordFilter) -> Result<MeasureTotals, StoreError> {
        self.store.totals(filter).await
    }

    pub async fn list_distinct_filter_values(
        &self,
        field: FilterField,
    ) -> Result<Vec<String>, StoreError> {
        self.store.distinct(field).await
    }

    pub async fn filter_options(&self) -> Result<FilterOptions, StoreError> {
        Ok(FilterOptions {
            categories: self.list_distinct_filter_values(FilterField::Category).await?,
            branches: self.list_distinct_filter_values(FilterField::Branch).await?,
            suppliers: self.list_distinct_filter_values(FilterField::Supplier).await?,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => Record::from(map),
            _ => panic!("record fixture must be an object"),
        }
    }

    // -------------------------------------------------------------------------
    // FILTER
    // -------------------------------------------------------------------------

    #[test]
    fn test_unrestricted_filter_matches_everything() {
        let filter = RecordFilter::default();
        assert!(filter.is_unrestricted());
        assert!(filter.matches(&record(json!({}))));
        assert!(filter.matches(&record(json!({"branch": null}))));
    }

    #[test]
    fn test_filter_requires_every_restricted_field() {
        let filter = RecordFilter::default()
            .allow(FilterField::Category, ["Dairy", "Bakery"])
            .allow(FilterField::Branch, ["North"]);
        assert!(filter.matches(&record(json!({"CategoryShortName": "Dairy", "branch": "North"}))));
        assert!(!filter.matches(&record(json!({"CategoryShortName": "Dairy", "branch": "South"}))));
        assert!(!filter.matches(&record(json!({"CategoryShortName": "Meat", "branch": "North"}))));
    }

    #[test]
    fn test_null_never_matches_allow_list() {
        let filter = RecordFilter::default().allow(FilterField::Supplier, [""]);
        assert!(!filter.matches(&record(json!({"SupplierAlias": null}))));
        assert!(!filter.matches(&record(json!({}))));
        assert!(filter.matches(&record(json!({"SupplierAlias": ""}))));
    }

    #[test]
    fn test_empty_allow_list_is_unrestricted() {
        let filter = RecordFilter::default()
            .allow(FilterField::Branch, ["North"])
            .allow(FilterField::Branch, Vec::<String>::new());
        assert!(filter.is_unrestricted());
    }

    #[test]
    fn test_from_params() {
        let filter =
            RecordFilter::from_params(Some(r#"["Dairy"]"#), Some("[]"), None).unwrap();
        assert_eq!(
            filter.allowed(FilterField::Category),
            Some(&BTreeSet::from(["Dairy".to_string()]))
        );
        assert_eq!(filter.allowed(FilterField::Branch), None);
        assert_eq!(filter.allowed(FilterField::Supplier), None);
    }

    #[test]
    fn test_from_params_numeric_entries_match_like_text() {
        let filter = RecordFilter::from_params(None, Some("[7, 12.0]"), None).unwrap();
        assert_eq!(
            filter.allowed(FilterField::Branch),
            Some(&BTreeSet::from(["12".to_string(), "7".to_string()]))
        );
        assert!(filter.matches(&record(json!({"branch": 7}))));
        assert!(filter.matches(&record(json!({"branch": "7"}))));
        assert!(filter.matches(&record(json!({"branch": 12}))));
        assert!(!filter.matches(&record(json!({"branch": "North"}))));
    }

    #[test]
    fn test_from_params_rejects_non_array() {
        let err = RecordFilter::from_params(Some(r#""Dairy""#), None, None).unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilter { ref param, .. } if param == "categories"));
    }

    #[test]
    fn test_from_params_rejects_malformed_json() {
        let err = RecordFilter::from_params(None, Some("[North"), None).unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilter { ref param, .. } if param == "branches"));
    }

    // -------------------------------------------------------------------------
    // PAGINATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_pagination_last_partial_page() {
        let p = Pagination::new(PageRequest::new(3, 100), 257);
        assert_eq!(p.total_pages, 3);
        assert!(!p.has_next_page);
        assert!(p.has_prev_page);
    }

    #[test]
    fn test_pagination_no_matches() {
        let p = Pagination::new(PageRequest::new(1, 100), 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next_page);
        assert!(!p.has_prev_page);
    }

    #[test]
    fn test_page_request_clamps_to_one() {
        let r = PageRequest::new(0, 0);
        assert_eq!((r.page, r.page_size), (1, 1));
        assert_eq!(r.skip(), 0);
        assert_eq!(PageRequest::new(4, 25).skip(), 75);
    }

    #[test]
    fn test_pagination_serializes_camel_case() {
        let doc = serde_json::to_value(Pagination::new(PageRequest::new(2, 10), 15)).unwrap();
        assert_eq!(
            doc,
            json!({"currentPage": 2, "totalPages": 2, "pageSize": 10, "totalRecords": 15,
                "hasNextPage": false, "hasPrevPage": true})
        );
    }

    // -------------------------------------------------------------------------
    // QUERY SERVICE
    // -------------------------------------------------------------------------

    fn numbered_store(n: usize) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_records((0..n).map(|i| {
            record(json!({
                "ArticleNo": i,
                "branch": if i % 2 == 0 { "Even" } else { "Odd" },
                "NetAmount": "1",
            }))
        })))
    }

    #[tokio::test]
    async fn test_query_page_257_records() {
        let service = QueryService::new(numbered_store(257));
        let page = service
            .query_page(&RecordFilter::default(), PageRequest::new(3, 100))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 57);
        assert_eq!(page.pagination.total_pages, 3);
        assert_eq!(page.pagination.total_records, 257);
        assert!(!page.pagination.has_next_page);
        assert!(page.pagination.has_prev_page);
        assert_eq!(page.records[0].record.get("ArticleNo"), Some(&json!(200)));
    }

    #[tokio::test]
    async fn test_totals_independent_of_pagination() {
        let service = QueryService::new(numbered_store(25));
        let filter = RecordFilter::default().allow(FilterField::Branch, ["Even"]);
        let page = service
            .query_page(&filter, PageRequest::new(1, 5))
            .await
            .unwrap();
        let totals = service.query_totals(&filter).await.unwrap();
        assert_eq!(page.records.len(), 5);
        assert_eq!(page.pagination.total_records, 13);
        assert_eq!(totals.get(Measure::NetAmount), 13.0);
    }

    #[tokio::test]
    async fn test_filter_options() {
        let store = Arc::new(MemoryStore::with_records([
            record(json!({"CategoryShortName": "B", "branch": "X", "SupplierAlias": "S"})),
            record(json!({"CategoryShortName": "A", "branch": "X"})),
            record(json!({"CategoryShortName": "B", "branch": null})),
        ]));
        let options = QueryService::new(store).filter_options().await.unwrap();
        assert_eq!(options.categories, vec!["A", "B"]);
        assert_eq!(options.branches, vec!["X"]);
        assert_eq!(options.suppliers, vec!["S"]);
    }

    #[test]
    fn test_totals_serialize_names() {
        let mut totals = MeasureTotals::default();
        totals.add(Measure::NetSlsQty, Some(&json!("2")));
        totals.add(Measure::NetSlsQty, Some(&json!("bad")));
        let doc = serde_json::to_value(totals).unwrap();
        assert_eq!(doc["totalNetSlsQty"], json!(2.0));
        assert_eq!(doc["totalSlsExtCostValue"], json!(0.0));
    }

    // -------------------------------------------------------------------------
    // PROPERTIES
    // -------------------------------------------------------------------------

    fn arb_record() -> impl Strategy<Value = Record> {
        let part = prop_oneof![
            Just(Value::Null),
            Just(json!("A")),
            Just(json!("B")),
            Just(json!(1)),
        ];
        (part.clone(), part.clone(), part, -50i64..50).prop_map(|(cat, branch, sup, amount)| {
            record(json!({
                "CategoryShortName": cat,
                "branch": branch,
                "SupplierAlias": sup,
                "NetAmount": amount.to_string(),
            }))
        })
    }

    fn arb_allow() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec(
            prop_oneof![Just("A".to_string()), Just("B".to_string()), Just("1".to_string())],
            0..3,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Totals equal the sum over exactly the matching records, and paging
        /// through every page yields exactly those records.
        #[test]
        fn prop_filter_correctness(
            records in proptest::collection::vec(arb_record(), 0..40),
            cats in arb_allow(),
            branches in arb_allow(),
            page_size in 1u64..7,
        ) {
            let filter = RecordFilter::default()
                .allow(FilterField::Category, cats)
                .allow(FilterField::Branch, branches);
            let expected: Vec<&Record> = records.iter().filter(|r| filter.matches(r)).collect();
            let expected_amount: f64 = expected
                .iter()
                .map(|r| r.measure(Measure::NetAmount).as_f64())
                .sum();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let service = QueryService::new(Arc::new(MemoryStore::with_records(records.clone())));
            let (totals, paged) = rt.block_on(async {
                let totals = service.query_totals(&filter).await.unwrap();
                let mut paged = Vec::new();
                let mut page = 1;
                loop {
                    let result = service
                        .query_page(&filter, PageRequest::new(page, page_size))
                        .await
                        .unwrap();
                    paged.extend(result.records.into_iter().map(|s| s.record));
                    if !result.pagination.has_next_page {
                        break;
                    }
                    page += 1;
                }
                (totals, paged)
            });

            prop_assert_eq!(totals.get(Measure::NetAmount), expected_amount);
            prop_assert_eq!(paged.iter().collect::<Vec<_>>(), expected);
        }
    }
}
