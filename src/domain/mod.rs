mod credential;
mod order;
mod payment;

pub use credential::{CheckInStatus, CredentialRecord, CredentialStatus};
pub use order::{CreateOrderRequest, Order, OrderPaymentStatus};
pub use payment::{CallbackPayload, Payment, PaymentStatus, PROVIDER_NAME};
