//! Conditional fan-out.
//!
//! A gate asks an external [`Judgment`] for a yes/no verdict and fans out the
//! declared handler entries only when the verdict matches the gate's
//! polarity. A declined gate is not an error; neither is a failed judgment,
//! which is logged and reported in the outcome.

use std::{future::Future, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    envelope::HandlerEntry,
    event_bus::{EventBus, EventResult},
    payload::{merge, Payload},
    subscription::HandlerError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GatePolarity {
    /// Fan out when the verdict is `true`.
    Affirmative,
    /// Fan out when the verdict is `false`.
    Negative,
}

impl GatePolarity {
    pub fn admits(&self, verdict: bool) -> bool {
        match self {
            GatePolarity::Affirmative => verdict,
            GatePolarity::Negative => !verdict,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionRequest {
    pub context: Payload,
    pub data: Payload,
}

impl DecisionRequest {
    pub fn new(context: Payload, data: Payload) -> Self {
        Self { context, data }
    }

    /// The trigger payload for fan-out; `data` wins over `context`.
    pub fn payload(&self) -> Payload {
        merge(&self.context, &self.data)
    }
}

#[async_trait]
pub trait Judgment: Send + Sync {
    async fn judge(&self, request: &DecisionRequest) -> Result<bool, HandlerError>;
}

pub struct FnJudgment<F>(F);

#[async_trait]
impl<F, Fut> Judgment for FnJudgment<F>
where
    F: Fn(DecisionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    async fn judge(&self, request: &DecisionRequest) -> Result<bool, HandlerError> {
        (self.0)(request.clone()).await
    }
}

pub fn judgment_fn<F, Fut>(f: F) -> FnJudgment<F>
where
    F: Fn(DecisionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    FnJudgment(f)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GateOutcome {
    FannedOut { fanned_out: usize },
    Declined { verdict: bool },
    JudgmentFailed { message: String },
}

impl EventBus {
    /// Runs `judgment` and fans out `handlers` from the request payload when
    /// the verdict agrees with `polarity`.
    pub async fn decide_and_fan_out(
        &self,
        polarity: GatePolarity,
        request: &DecisionRequest,
        judgment: &dyn Judgment,
        handlers: &[HandlerEntry],
    ) -> EventResult<GateOutcome> {
        let verdict = match AssertUnwindSafe(judgment.judge(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!("judgment failed: {}", e);
                return Ok(GateOutcome::JudgmentFailed {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!("judgment panicked");
                return Ok(GateOutcome::JudgmentFailed {
                    message: "judgment panicked".to_string(),
                });
            }
        };

        if !polarity.admits(verdict) {
            debug!("{} gate declined on verdict {}", polarity, verdict);
            return Ok(GateOutcome::Declined { verdict });
        }

        self.ensure_accepting()?;
        let fanned_out = self.fan_out(&request.payload(), "gate", None, handlers);
        Ok(GateOutcome::FannedOut { fanned_out })
    }
}
