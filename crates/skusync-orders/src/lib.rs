//! Paid-order webhook handling: signature check, fiscal document mapping and
//! issuance against the accounting platform.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{NaiveDate, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use skusync_adapters::{DocumentIssuer, OrderNoteWriter, RemoteError};
use skusync_core::{DocumentClient, DocumentDetail, DocumentRequest, IssuedDocument, PaidOrder};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "skusync-orders";

pub const SIGNATURE_HEADER: &str = "X-Shopify-Hmac-Sha256";

type HmacSha256 = Hmac<Sha256>;

/// Reasons a webhook delivery is refused before any document work starts.
#[derive(Debug, Error)]
pub enum WebhookRejection {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("malformed order payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Failures while issuing the fiscal document for an accepted order.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("line item {index} has an invalid price {price:?}")]
    InvalidLineItem { index: usize, price: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Shopify webhook HMAC: base64(HMAC-SHA256(secret, raw body)).
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, payload: &[u8]) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(payload);
        Some(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Some(expected) = self.sign(payload) else {
            return false;
        };
        let expected = expected.as_bytes();
        let provided = signature.trim().as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided).into()
    }
}

/// Document type ids configured in the accounting account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentTypeIds {
    pub invoice: u32,
    pub receipt: u32,
}

impl Default for DocumentTypeIds {
    fn default() -> Self {
        Self {
            invoice: 33,
            receipt: 39,
        }
    }
}

/// Cart attributes as a name → value map; later duplicates win and null values clear.
pub fn note_attributes(order: &PaidOrder) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in &order.note_attributes {
        match &attr.value {
            Some(value) => {
                attrs.insert(attr.name.clone(), value.clone());
            }
            None => {
                attrs.remove(&attr.name);
            }
        }
    }
    attrs
}

fn attr<'a>(attrs: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    attrs.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

pub fn build_document(
    order: &PaidOrder,
    attrs: &HashMap<String, String>,
    types: DocumentTypeIds,
    emission_date: NaiveDate,
) -> Result<DocumentRequest, OrderError> {
    let is_invoice = attr(attrs, "document_type")
        .unwrap_or("boleta")
        .eq_ignore_ascii_case("factura");
    let document_type_id = if is_invoice { types.invoice } else { types.receipt };

    let details = order
        .line_items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let net_unit_value = item.price.trim().parse::<f64>().map_err(|_| {
                OrderError::InvalidLineItem {
                    index,
                    price: item.price.clone(),
                }
            })?;
            Ok(DocumentDetail {
                quantity: item.quantity,
                net_unit_value,
                description: item.title.clone(),
                code: item.sku.clone().unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, OrderError>>()?;

    let customer_name = order
        .customer
        .as_ref()
        .map(|c| {
            format!(
                "{} {}",
                c.first_name.as_deref().unwrap_or_default(),
                c.last_name.as_deref().unwrap_or_default()
            )
            .trim()
            .to_string()
        })
        .unwrap_or_default();
    let shipping = order.shipping_address.as_ref();

    let client = DocumentClient {
        legal_name: attr(attrs, "razon_social")
            .map(str::to_string)
            .unwrap_or(customer_name),
        rut: attr(attrs, "rut").unwrap_or_default().to_string(),
        address: attr(attrs, "direccion")
            .or_else(|| non_empty(shipping.and_then(|s| s.address1.as_deref())))
            .unwrap_or_default()
            .to_string(),
        commune: attr(attrs, "comuna")
            .or_else(|| non_empty(shipping.and_then(|s| s.city.as_deref())))
            .unwrap_or_default()
            .to_string(),
        email: attr(attrs, "email_doc")
            .or_else(|| non_empty(order.email.as_deref()))
            .unwrap_or_default()
            .to_string(),
    };

    Ok(DocumentRequest {
        emission_date,
        document_type_id,
        reference: order.reference(),
        client,
        details,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Issued {
        order_id: u64,
        document_id: Option<i64>,
    },
    /// The event was accepted but no document was issued; the reason is logged.
    IssueFailed { order_id: u64, reason: String },
}

pub struct OrderEventHandler {
    verifier: WebhookVerifier,
    enforce_signature: bool,
    issuer: Arc<dyn DocumentIssuer>,
    notes: Arc<dyn OrderNoteWriter>,
    document_types: DocumentTypeIds,
}

impl OrderEventHandler {
    pub fn new(
        verifier: WebhookVerifier,
        issuer: Arc<dyn DocumentIssuer>,
        notes: Arc<dyn OrderNoteWriter>,
    ) -> Self {
        Self {
            verifier,
            enforce_signature: true,
            issuer,
            notes,
            document_types: DocumentTypeIds::default(),
        }
    }

    pub fn with_signature_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_signature = enforce;
        self
    }

    pub fn with_document_types(mut self, document_types: DocumentTypeIds) -> Self {
        self.document_types = document_types;
        self
    }

    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<OrderOutcome, WebhookRejection> {
        self.handle_at(body, signature, Utc::now().date_naive()).await
    }

    /// Authenticates the raw body, then parses it and issues the document.
    pub async fn handle_at(
        &self,
        body: &[u8],
        signature: Option<&str>,
        emission_date: NaiveDate,
    ) -> Result<OrderOutcome, WebhookRejection> {
        let valid = signature.is_some_and(|sig| self.verifier.verify(body, sig));
        if !valid {
            if self.enforce_signature {
                warn!(has_signature = signature.is_some(), "order webhook rejected: invalid signature");
                return Err(WebhookRejection::InvalidSignature);
            }
            warn!("order webhook signature invalid; processing because enforcement is off");
        }

        let order: PaidOrder = serde_json::from_slice(body)?;
        let order_id = order.id;
        info!(
            order_id,
            order_name = order.name.as_deref().unwrap_or_default(),
            line_items = order.line_items.len(),
            "order paid"
        );

        let attrs = note_attributes(&order);
        match self.issue(&order, &attrs, emission_date).await {
            Ok(document) => {
                let note = format!(
                    "Bsale OK: ID {}",
                    document
                        .id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "N/A".to_string())
                );
                if let Err(err) = self.notes.save_order_note(order_id, &note).await {
                    warn!(order_id, error = %err, "could not save order note");
                }
                info!(order_id, document_id = ?document.id, "fiscal document issued");
                Ok(OrderOutcome::Issued {
                    order_id,
                    document_id: document.id,
                })
            }
            Err(err) => {
                error!(order_id, error = %err, "fiscal document issuance failed");
                Ok(OrderOutcome::IssueFailed {
                    order_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn issue(
        &self,
        order: &PaidOrder,
        attrs: &HashMap<String, String>,
        emission_date: NaiveDate,
    ) -> Result<IssuedDocument, OrderError> {
        let request = build_document(order, attrs, self.document_types, emission_date)?;
        Ok(self.issuer.issue_document(&request).await?)
    }
}
