//! Payment verification and settlement seam.
//!
//! The payment gate never inspects proofs itself. It asks a [`Facilitator`]
//! whether a proof satisfies the requirements, and asks it again to settle
//! once the downstream handler has produced a successful response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::proto::{PaymentProof, PaymentRequirements, SettleResponse, VerifyResponse};

/// A boxed, pinned, `Send` future with a borrowed lifetime.
///
/// Used in place of `async fn` in traits so implementations stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error produced by a facilitator implementation.
pub type FacilitatorError = Box<dyn std::error::Error + Send + Sync>;

/// Remote authority that verifies and settles payment proofs.
///
/// Implementations typically perform network I/O, so both operations are
/// asynchronous. The proof is forwarded verbatim.
pub trait Facilitator: Send + Sync {
    /// Checks that `proof` satisfies `requirements` without moving funds.
    fn verify<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>>;

    /// Executes the payment described by a previously verified proof.
    fn settle<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>>;
}

impl<T: Facilitator + ?Sized> Facilitator for Arc<T> {
    fn verify<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>> {
        (**self).verify(proof, requirements)
    }

    fn settle<'a>(
        &'a self,
        proof: &'a PaymentProof,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>> {
        (**self).settle(proof, requirements)
    }
}
