//! Test mailer that records outgoing messages instead of delivering them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    error::{AppError, Result},
    notify::{ConfirmationEmail, Mailer},
};

pub struct RecordingMailer {
    sent: Mutex<Vec<ConfirmationEmail>>,
    fail_next: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Makes the next send fail, to exercise finalization-error handling.
    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<ConfirmationEmail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for RecordingMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: ConfirmationEmail) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::Internal("scripted mail failure".to_string()));
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}
