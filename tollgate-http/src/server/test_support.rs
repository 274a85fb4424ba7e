//! In-memory facilitator and log sink for layer tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tollgate::facilitator::{BoxFuture, Facilitator, FacilitatorError};
use tollgate::log::{LogEntry, LogSink};
use tollgate::proto::{
    PaymentProof, PaymentRequirements, SettleResponse, VerifyRequest, VerifyResponse,
};

/// Collects every entry it is given.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSink(Arc<Mutex<Vec<LogEntry>>>);

impl RecordingSink {
    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().unwrap().clone()
    }

    /// The only recorded entry. Panics unless exactly one was recorded.
    pub(crate) fn single(&self) -> LogEntry {
        let entries = self.entries();
        assert_eq!(entries.len(), 1, "expected exactly one entry, got {entries:?}");
        entries.into_iter().next().unwrap()
    }
}

impl LogSink for RecordingSink {
    fn add(&self, entry: LogEntry) {
        self.0.lock().unwrap().push(entry);
    }
}

/// What [`FakeFacilitator::verify`] answers.
#[derive(Debug, Clone)]
pub(crate) enum Verdict {
    Valid,
    Invalid(String),
    Unreachable,
}

/// Facilitator that records calls and answers with a fixed verdict.
#[derive(Debug, Clone)]
pub(crate) struct FakeFacilitator {
    verdict: Verdict,
    delay: Duration,
    settle_fails: bool,
    verifies: Arc<Mutex<Vec<VerifyRequest>>>,
    settles: Arc<Mutex<Vec<VerifyRequest>>>,
}

impl FakeFacilitator {
    pub(crate) fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            delay: Duration::ZERO,
            settle_fails: false,
            verifies: Arc::default(),
            settles: Arc::default(),
        }
    }

    pub(crate) const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) const fn with_failing_settle(mut self) -> Self {
        self.settle_fails = true;
        self
    }

    pub(crate) fn verifies(&self) -> Vec<VerifyRequest> {
        self.verifies.lock().unwrap().clone()
    }

    pub(crate) fn settles(&self) -> Vec<VerifyRequest> {
        self.settles.lock().unwrap().clone()
    }
}

impl Facilitator for FakeFacilitator {
    fn verify<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.verifies
                .lock()
                .unwrap()
                .push(VerifyRequest::new(proof, requirements));
            match &self.verdict {
                Verdict::Valid => Ok(VerifyResponse::valid("0xpayer")),
                Verdict::Invalid(reason) => Ok(VerifyResponse::invalid(reason.clone())),
                Verdict::Unreachable => Err("facilitator unreachable".into()),
            }
        })
    }

    fn settle<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>> {
        Box::pin(async move {
            self.settles
                .lock()
                .unwrap()
                .push(VerifyRequest::new(proof, requirements));
            if self.settle_fails {
                return Err("settlement rejected upstream".into());
            }
            Ok(SettleResponse {
                success: true,
                transaction: Some("0xtx".to_owned()),
                payer: Some("0xpayer".to_owned()),
                ..SettleResponse::default()
            })
        })
    }
}
