use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Value};

use crate::{
    config::GatewayConfig,
    error::{AppError, Result},
    gateway::{
        format_amount_2dp, request_hash, to_minor_units, CheckoutCreated, CheckoutRequest,
        PaymentGateway, StatusOutcome, TransactionStatus,
    },
};

/// HTTP client for the OnePay-style IPG. Constructed once at startup and
/// shared; reqwest pools connections internally. Every request carries a
/// hard timeout so a provider that accepts the connection but never
/// answers cannot hang a verification attempt past its slice of the
/// polling budget.
pub struct OnePayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl OnePayClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                AppError::Internal(format!("Failed to build gateway HTTP client: {}", e))
            })?;

        Ok(Self { http, config })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.config.app_token)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Provider unreachable: {}", e)))?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or_else(|_| json!({}));

        if !status.is_success() {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Provider returned an error");
            return Err(AppError::Gateway(format!("{} ({})", message, status)));
        }

        Ok(payload)
    }
}

#[async_trait]
impl PaymentGateway for OnePayClient {
    async fn create_checkout(&self, request: &CheckoutRequest) -> Result<CheckoutCreated> {
        // The app id/token/salt triple is scoped to a single currency on
        // the provider side; anything else would be rejected after the
        // network round trip anyway.
        if request.currency != self.config.currency {
            return Err(AppError::Gateway(format!(
                "Provider credentials accept {} only, got {}",
                self.config.currency, request.currency
            )));
        }

        let hash = request_hash(
            &self.config.app_id,
            &request.currency,
            request.amount_cents,
            &self.config.hash_salt,
        );

        // The 2dp string feeds both the hash and the payload; the provider
        // rejects requests where the two disagree.
        let body = json!({
            "currency": request.currency,
            "app_id": self.config.app_id,
            "hash": hash,
            "amount": format_amount_2dp(request.amount_cents),
            "reference": request.reference,
            "customer_first_name": request.customer.first_name,
            "customer_last_name": request.customer.last_name,
            "customer_phone_number": request.customer.phone,
            "customer_email": request.customer.email,
            "transaction_redirect_url": request.redirect_url,
            "additional_data": request.additional_data,
        });

        let payload = self.post_json("/v3/checkout/link/", &body).await?;

        // Provider docs call it transaction_id, older responses used
        // ipg_transaction_id; accept both.
        let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));
        let provider_tx_id = data
            .get("transaction_id")
            .or_else(|| data.get("ipg_transaction_id"))
            .or_else(|| data.get("data").and_then(|d| d.get("transaction_id")))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let redirect_url = data
            .get("payment_url")
            .or_else(|| data.get("gateway").and_then(|g| g.get("redirect_url")))
            .or_else(|| data.get("redirect_url"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        match (provider_tx_id, redirect_url) {
            (Some(provider_tx_id), Some(redirect_url)) => Ok(CheckoutCreated {
                provider_tx_id,
                redirect_url,
            }),
            _ => Err(AppError::Gateway(
                "Provider response missing transaction id or redirect url".to_string(),
            )),
        }
    }

    async fn get_status(&self, provider_tx_id: &str) -> Result<TransactionStatus> {
        let body = json!({
            "app_id": self.config.app_id,
            "transaction_id": provider_tx_id,
        });

        let payload = self.post_json("/v3/transaction/status/", &body).await?;
        let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));

        Ok(parse_status_payload(&data))
    }
}

/// Maps the provider's loosely typed status payload onto an outcome.
/// A paid signal may arrive as a boolean, a numeric flag, or only as
/// message text; a definitive failure needs an explicit negative flag
/// plus failure wording, everything else stays PENDING.
fn parse_status_payload(data: &Value) -> TransactionStatus {
    let flag = data.get("status");
    let message = data
        .get("status_message")
        .or_else(|| data.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let upper = message.as_deref().unwrap_or("").to_uppercase();

    let flag_is_true = matches!(flag, Some(Value::Bool(true)))
        || flag.and_then(Value::as_i64) == Some(1)
        || flag.and_then(Value::as_str) == Some("1");
    let flag_is_false = matches!(flag, Some(Value::Bool(false)))
        || flag.and_then(Value::as_i64) == Some(0)
        || flag.and_then(Value::as_str) == Some("0");

    let paid = flag_is_true || upper.contains("SUCCESS") || upper.contains("PAID");
    let failed = !paid
        && flag_is_false
        && (upper.contains("FAIL") || upper.contains("DECLIN") || upper.contains("CANCEL"));

    let outcome = if paid {
        StatusOutcome::Paid
    } else if failed {
        StatusOutcome::Failed
    } else {
        StatusOutcome::Pending
    };

    TransactionStatus {
        outcome,
        amount_cents: data.get("amount").and_then(Value::as_f64).and_then(to_minor_units),
        currency: data.get("currency").and_then(Value::as_str).map(str::to_owned),
        paid_at: data.get("paid_on").and_then(Value::as_str).and_then(parse_paid_on),
        message,
    }
}

fn parse_paid_on(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Provider sometimes reports "YYYY-MM-DD HH:MM:SS" without a zone
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CustomerInfo;

    fn test_config(base_url: String, timeout_secs: u64) -> GatewayConfig {
        GatewayConfig {
            base_url,
            app_id: "app".to_string(),
            app_token: "token".to_string(),
            hash_salt: "salt".to_string(),
            currency: "USD".to_string(),
            redirect_url: "http://localhost:8080/payment/return".to_string(),
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn stalled_provider_times_out() {
        // A provider that accepts the TCP connection and then goes quiet
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let _hold = socket;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let client = OnePayClient::new(test_config(format!("http://{}", addr), 1)).unwrap();

        let started = std::time::Instant::now();
        let result = client.get_status("TX-1").await;
        assert!(matches!(result, Err(AppError::Gateway(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn checkout_rejects_foreign_currency_before_transmitting() {
        // base_url points nowhere routable; the guard fires first
        let client = OnePayClient::new(test_config("http://127.0.0.1:9".to_string(), 1)).unwrap();

        let request = CheckoutRequest {
            amount_cents: 10000,
            currency: "LKR".to_string(),
            reference: "APSC-00001-AAAAAA".to_string(),
            customer: CustomerInfo {
                first_name: "Maya".to_string(),
                last_name: "Perera".to_string(),
                email: "maya@example.com".to_string(),
                phone: "N/A".to_string(),
            },
            redirect_url: "http://localhost:8080/payment/return".to_string(),
            additional_data: "APSC-00001".to_string(),
        };

        let result = client.create_checkout(&request).await;
        match result {
            Err(AppError::Gateway(msg)) => assert!(msg.contains("LKR")),
            other => panic!("expected gateway error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn numeric_flag_means_paid() {
        let status = parse_status_payload(&json!({
            "status": 1,
            "status_message": "Transaction complete",
            "amount": 100.0,
            "currency": "USD",
        }));
        assert_eq!(status.outcome, StatusOutcome::Paid);
        assert_eq!(status.amount_cents, Some(10000));
        assert_eq!(status.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn success_message_alone_means_paid() {
        let status = parse_status_payload(&json!({
            "status_message": "PAYMENT SUCCESSFUL",
        }));
        assert_eq!(status.outcome, StatusOutcome::Paid);
    }

    #[test]
    fn explicit_decline_means_failed() {
        let status = parse_status_payload(&json!({
            "status": 0,
            "status_message": "Card declined",
        }));
        assert_eq!(status.outcome, StatusOutcome::Failed);
    }

    #[test]
    fn ambiguous_payload_stays_pending() {
        let status = parse_status_payload(&json!({
            "status_message": "Awaiting confirmation",
        }));
        assert_eq!(status.outcome, StatusOutcome::Pending);

        // A bare negative flag without failure wording is still pending:
        // the provider reuses it for in-flight transactions.
        let status = parse_status_payload(&json!({ "status": 0 }));
        assert_eq!(status.outcome, StatusOutcome::Pending);
    }

    #[test]
    fn paid_on_parses_both_provider_formats() {
        assert!(parse_paid_on("2026-03-01T10:15:00Z").is_some());
        assert!(parse_paid_on("2026-03-01 10:15:00").is_some());
        assert!(parse_paid_on("yesterday").is_none());
    }
}
