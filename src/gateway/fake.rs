//! Scripted gateway for tests. Enabled via the `test-utils` feature so
//! integration tests can drive the reconciliation engine without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    error::{AppError, Result},
    gateway::{CheckoutCreated, CheckoutRequest, PaymentGateway, TransactionStatus},
};

#[derive(Debug, Clone)]
enum ScriptedStatus {
    Report(TransactionStatus),
    Unreachable(String),
}

pub struct FakeGateway {
    checkout_result: Mutex<Option<CheckoutCreated>>,
    statuses: Mutex<VecDeque<ScriptedStatus>>,
    /// Served when the queue runs dry, so a bounded loop sees a stable
    /// provider view no matter how many times it polls.
    fallback: Mutex<ScriptedStatus>,
    checkout_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            checkout_result: Mutex::new(Some(CheckoutCreated {
                provider_tx_id: "TX-FAKE-1".to_string(),
                redirect_url: "https://pay.example/checkout/TX-FAKE-1".to_string(),
            })),
            statuses: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(ScriptedStatus::Unreachable(
                "no scripted status".to_string(),
            )),
            checkout_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_checkout(&self, result: CheckoutCreated) {
        *self.checkout_result.lock().unwrap() = Some(result);
    }

    /// Makes the next `create_checkout` call fail with a gateway error.
    pub fn fail_checkout(&self) {
        *self.checkout_result.lock().unwrap() = None;
    }

    pub fn push_status(&self, status: TransactionStatus) {
        self.statuses
            .lock()
            .unwrap()
            .push_back(ScriptedStatus::Report(status));
    }

    pub fn push_unreachable(&self, message: &str) {
        self.statuses
            .lock()
            .unwrap()
            .push_back(ScriptedStatus::Unreachable(message.to_string()));
    }

    /// Status served once the queue is exhausted.
    pub fn set_fallback_status(&self, status: TransactionStatus) {
        *self.fallback.lock().unwrap() = ScriptedStatus::Report(status);
    }

    pub fn set_fallback_unreachable(&self, message: &str) {
        *self.fallback.lock().unwrap() = ScriptedStatus::Unreachable(message.to_string());
    }

    pub fn checkout_calls(&self) -> usize {
        self.checkout_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout(&self, _request: &CheckoutRequest) -> Result<CheckoutCreated> {
        self.checkout_calls.fetch_add(1, Ordering::SeqCst);
        self.checkout_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::Gateway("scripted checkout failure".to_string()))
    }

    async fn get_status(&self, _provider_tx_id: &str) -> Result<TransactionStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        match next {
            ScriptedStatus::Report(status) => Ok(status),
            ScriptedStatus::Unreachable(message) => Err(AppError::Gateway(message)),
        }
    }
}
