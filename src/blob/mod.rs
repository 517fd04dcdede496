//! Invoice document storage.
//!
//! Uploads rendered invoices to the object store and issues short-lived
//! signed URLs. The public API never exposes blob URLs directly; the
//! download endpoint verifies ownership first and redirects to a URL that
//! expires after five minutes.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;

use crate::shared::config::BlobConfig;
use crate::shared::models::Invoice;

const SIGNED_URL_TTL: Duration = Duration::from_secs(5 * 60);

/// Renders an invoice record into the document buffer the store uploads.
/// The layout engine is an external collaborator; implementations only need
/// to honor this contract.
pub trait InvoiceRenderer: Send + Sync {
    fn render(&self, invoice: &Invoice) -> Vec<u8>;
}

/// Plain-text stand-in renderer so the upload path works end to end without
/// the layout service. Swap at the composition root.
pub struct TextInvoiceRenderer;

impl InvoiceRenderer for TextInvoiceRenderer {
    fn render(&self, invoice: &Invoice) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("TAX INVOICE {}\n", invoice.number));
        out.push_str(&format!("Date: {}\n", invoice.date));
        out.push_str(&format!("{} ({})\n", invoice.business_name, invoice.gst_number));
        out.push_str(&format!("Billed to: {}\n\n", invoice.customer_name));
        for line in &invoice.lines {
            out.push_str(&format!(
                "{}  x{}  @ {}  = {}\n",
                line.description, line.quantity, line.price, line.amount
            ));
        }
        out.push_str(&format!("\nSubtotal: {}\n", invoice.subtotal));
        out.push_str(&format!("CGST: {}\nSGST: {}\n", invoice.cgst, invoice.sgst));
        if let Some(igst) = &invoice.igst {
            out.push_str(&format!("IGST: {igst}\n"));
        }
        out.push_str(&format!("Total: {}\n", invoice.total));
        out.into_bytes()
    }
}

pub struct InvoiceBlobStore {
    client: S3Client,
    container: String,
}

impl InvoiceBlobStore {
    pub async fn connect(config: &BlobConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region("auto")
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "static",
            ));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let base = loader.load().await;

        let s3_config = S3ConfigBuilder::from(&base).force_path_style(true).build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            container: config.container.clone(),
        })
    }

    pub fn object_key(invoice_number: &str) -> String {
        format!("invoice_{invoice_number}.pdf")
    }

    pub async fn upload_invoice(&self, invoice_number: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.container)
            .key(Self::object_key(invoice_number))
            .content_type("application/pdf")
            .body(bytes.into())
            .send()
            .await
            .context("invoice upload failed")?;
        Ok(())
    }

    /// Read-only signed URL valid for five minutes.
    pub async fn signed_download_url(&self, invoice_number: &str) -> Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.container)
            .key(Self::object_key(invoice_number))
            .presigned(
                PresigningConfig::expires_in(SIGNED_URL_TTL)
                    .context("presigning config rejected TTL")?,
            )
            .await
            .context("presigning failed")?;
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::str::FromStr;

    #[test]
    fn object_keys_follow_the_store_contract() {
        assert_eq!(
            InvoiceBlobStore::object_key("INV-2026-042"),
            "invoice_INV-2026-042.pdf"
        );
    }

    #[test]
    fn text_renderer_carries_the_figures() {
        let invoice = Invoice {
            number: "INV-2026-042".into(),
            date: "14/03/2026".into(),
            customer_name: "Rahul Sharma".into(),
            lines: vec![],
            subtotal: BigDecimal::from_str("660.00").unwrap(),
            cgst: BigDecimal::from_str("59.40").unwrap(),
            sgst: BigDecimal::from_str("59.40").unwrap(),
            igst: None,
            total: BigDecimal::from_str("778.80").unwrap(),
            business_name: "Sharma Traders".into(),
            gst_number: "29ABCDE1234F1Z5".into(),
        };
        let text = String::from_utf8(TextInvoiceRenderer.render(&invoice)).unwrap();
        assert!(text.contains("INV-2026-042"));
        assert!(text.contains("778.80"));
        assert!(!text.contains("IGST"));
    }
}
