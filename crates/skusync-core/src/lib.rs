//! Core data model shared by the Bsale / Shopify bridge crates.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "skusync-core";

/// Default number of catalog records requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Identifier the accounting platform sends either as a number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(n) => write!(f, "{n}"),
            RemoteId::Text(s) => f.write_str(s),
        }
    }
}

/// Product reference attached to an accounting-platform variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CatalogProductRef {
    #[serde(default)]
    pub id: Option<RemoteId>,
    #[serde(default)]
    pub href: Option<String>,
}

/// Source-of-truth variant record read from the accounting platform (Bsale).
///
/// `code` is the primary identifier (SKU) and `bar_code` the secondary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CatalogRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "barCode")]
    pub bar_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub product: Option<CatalogProductRef>,
}

impl CatalogRecord {
    /// Trimmed primary identifier, empty when absent.
    pub fn primary_key(&self) -> &str {
        trimmed(self.code.as_deref())
    }

    /// Trimmed secondary identifier, empty when absent.
    pub fn secondary_key(&self) -> &str {
        trimmed(self.bar_code.as_deref())
    }
}

fn trimmed(value: Option<&str>) -> &str {
    value.map(str::trim).unwrap_or_default()
}

/// One page of the accounting catalog plus the pagination metadata reported with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CatalogPage {
    #[serde(default)]
    pub items: Vec<CatalogRecord>,
    /// Total records in the full catalog at call time.
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommerceProductRef {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Variant record held by the commerce platform (Shopify). Only `sku` is ever mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommerceVariant {
    pub id: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub product: Option<CommerceProductRef>,
}

impl CommerceVariant {
    pub fn has_sku(&self, sku: &str) -> bool {
        self.sku.as_deref() == Some(sku)
    }
}

/// Aggregate counters of one completed reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SweepResult {
    pub processed: usize,
    pub updated: usize,
}

/// Paid-order webhook payload, reduced to the fields the bridge reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaidOrder {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer: Option<OrderCustomer>,
    #[serde(default)]
    pub shipping_address: Option<OrderAddress>,
    #[serde(default)]
    pub line_items: Vec<OrderLineItem>,
    #[serde(default)]
    pub note_attributes: Vec<NoteAttribute>,
}

impl PaidOrder {
    /// Reference printed on the fiscal document: the order name, or its id.
    pub fn reference(&self) -> String {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("Shopify {name}"),
            None => format!("Shopify {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrderCustomer {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrderAddress {
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub quantity: u32,
    /// Decimal price as sent by the commerce platform, e.g. `"19990.00"`.
    pub price: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sku: Option<String>,
}

/// Cart attribute captured at checkout (`document_type`, `rut`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteAttribute {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Fiscal document (invoice or receipt) submitted to the accounting platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    pub emission_date: NaiveDate,
    pub document_type_id: u32,
    pub reference: String,
    pub client: DocumentClient,
    pub details: Vec<DocumentDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentClient {
    pub legal_name: String,
    pub rut: String,
    pub address: String,
    pub commune: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDetail {
    pub quantity: u32,
    pub net_unit_value: f64,
    pub description: String,
    pub code: String,
}

/// Accounting-platform response for an issued document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssuedDocument {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub url_pdf: Option<String>,
}
