use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Attachment, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use qrcode::{render::svg, EcLevel, QrCode};

use crate::{
    config::EmailConfig,
    domain::{CredentialRecord, Order},
    error::{AppError, Result},
    repository::CredentialRepository,
};

#[cfg(any(test, feature = "test-utils"))]
mod recording;
#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingMailer;

#[derive(Debug, Clone)]
pub struct ConfirmationEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    /// The credential QR, rendered as SVG and embedded inline.
    pub qr_svg: String,
}

/// Outbound mail boundary. A single SMTP-backed instance is constructed
/// at startup and injected; tests use a recording fake.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: ConfirmationEmail) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| AppError::Internal("SMTP host not configured".to_string()))?;
        let from_address = config
            .from_address
            .clone()
            .ok_or_else(|| AppError::Internal("Email from address not configured".to_string()))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| AppError::Internal(format!("Invalid SMTP relay: {}", e)))?;

        if let (Some(username), Some(password)) =
            (config.smtp_username.clone(), config.smtp_password.clone())
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            transport: builder.build(),
            from_address,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: ConfirmationEmail) -> Result<()> {
        let svg_type = ContentType::parse("image/svg+xml")
            .map_err(|e| AppError::Internal(format!("Bad attachment content type: {}", e)))?;

        let qr_part = Attachment::new_inline("qr".to_string()).body(email.qr_svg, svg_type);

        let message = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| AppError::Internal(format!("Bad from address: {}", e)))?,
            )
            .to(email
                .to
                .parse()
                .map_err(|e| AppError::BadRequest(format!("Bad recipient address: {}", e)))?)
            .subject(email.subject)
            .multipart(
                MultiPart::related()
                    .singlepart(SinglePart::html(email.html_body))
                    .singlepart(qr_part),
            )
            .map_err(|e| AppError::Internal(format!("Failed to build email: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to send email: {}", e)))?;

        Ok(())
    }
}

/// Stand-in for deployments without SMTP configured: logs the send and
/// succeeds, so local development exercises the full finalization path.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: ConfirmationEmail) -> Result<()> {
        tracing::info!("Email delivery disabled; would send \"{}\" to {}", email.subject, email.to);
        Ok(())
    }
}

/// Renders the QR text (prefix + token) as an SVG image for embedding.
pub fn render_qr_svg(qr_text: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(qr_text.as_bytes(), EcLevel::M)
        .map_err(|e| AppError::Internal(format!("Failed to build QR code: {}", e)))?;

    Ok(code
        .render::<svg::Color>()
        .min_dimensions(240, 240)
        .quiet_zone(true)
        .build())
}

/// Sends the one-time payment confirmation carrying the entry credential.
/// The credential record's sent-at marker makes delivery at-most-once:
/// repeated finalization attempts after the first send are no-ops.
pub struct Notifier {
    credentials: Arc<dyn CredentialRepository>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(credentials: Arc<dyn CredentialRepository>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            credentials,
            mailer,
        }
    }

    /// Returns whether this call actually sent the email.
    pub async fn notify_once(
        &self,
        order: &Order,
        record: &CredentialRecord,
        qr_svg: &str,
    ) -> Result<bool> {
        // Re-read the record: issuance may have just created it, and an
        // earlier retry may have already sent the email.
        let fresh = self
            .credentials
            .find_by_id(record.id)
            .await?
            .ok_or_else(|| AppError::Internal("Credential record missing after issuing".to_string()))?;

        if fresh.email_sent_at.is_some() {
            return Ok(false);
        }

        let email = ConfirmationEmail {
            to: order.email.clone(),
            subject: format!("Registration {} confirmed - your entry pass", order.code),
            html_body: confirmation_body(order),
            qr_svg: qr_svg.to_string(),
        };

        self.mailer.send(email).await?;

        let claimed = self.credentials.mark_email_sent(fresh.id, Utc::now()).await?;
        if !claimed {
            tracing::warn!(
                "Confirmation for order {} sent concurrently by another path",
                order.id
            );
        }

        Ok(claimed)
    }
}

fn confirmation_body(order: &Order) -> String {
    format!(
        r#"<html><body>
<p>Dear {},</p>
<p>Your payment for registration <strong>{}</strong> has been received.</p>
<p>Present the QR code below at the check-in desk:</p>
<p><img src="cid:qr" alt="Entry QR code" width="240" height="240"></p>
<p>Please keep this email; the code is your entry pass.</p>
</body></html>"#,
        order.first_name, order.code
    )
}
