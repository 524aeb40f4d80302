//! Rule-based PMode resolution
//!
//! Inbound user messages are matched against every configured receiving PMode
//! with a weighted score. Signals are not scored at all: they inherit the
//! sending PMode stored with the outbound user message they refer to.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{MshError, MshResult, ResolutionError};
use crate::ledger::Ledger;
use crate::message::{Party, SignalMessage, UserMessage};
use crate::pmode::{from_snapshot, ReceivingPMode, SendingPMode};

// ----------------------------------------------------------------------------
// Scoring Weights
// ----------------------------------------------------------------------------

/// Points awarded per matched attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// `AgreementRef/@pmode` names the PMode
    pub pmode_id: u32,
    /// From and To party ids
    pub party: u32,
    /// From and To roles
    pub role: u32,
    pub service: u32,
    pub action: u32,
    pub agreement: u32,
    pub mpc: u32,
    /// Minimum score for a PMode to be a candidate
    pub threshold: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            pmode_id: 30,
            party: 15,
            role: 5,
            service: 5,
            action: 5,
            agreement: 5,
            mpc: 2,
            threshold: 10,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> MshResult<()> {
        if self.threshold == 0 {
            return Err(MshError::config_error(
                "Resolver threshold must be positive, otherwise every PMode is a candidate",
            ));
        }
        Ok(())
    }
}

/// Score of one PMode for a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PModeScore {
    pub pmode_id: String,
    pub score: u32,
}

// ----------------------------------------------------------------------------
// Attribute Matching
// ----------------------------------------------------------------------------

/// Party ids the PMode constrains, all of which the message must carry
fn party_ids_match(constraint: &Party, actual: &Party) -> bool {
    constraint.party_ids.iter().all(|expected| {
        actual.party_ids.iter().any(|candidate| {
            candidate.id == expected.id
                && (expected.party_type.is_none() || candidate.party_type == expected.party_type)
        })
    })
}

fn constrains_ids(party: &Option<Party>) -> Option<&Party> {
    party.as_ref().filter(|p| !p.party_ids.is_empty())
}

fn constrains_role(party: &Option<Party>) -> Option<&str> {
    party
        .as_ref()
        .map(|p| p.role.as_str())
        .filter(|role| !role.is_empty())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

// ----------------------------------------------------------------------------
// PMode Resolver
// ----------------------------------------------------------------------------

/// Weighted matcher selecting the receiving PMode for a user message
#[derive(Debug, Clone, Default)]
pub struct PModeResolver {
    weights: ScoringWeights,
}

impl PModeResolver {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score a single PMode
    ///
    /// Unconstrained attributes and mismatches both contribute zero; a
    /// mismatch never disqualifies a PMode on its own.
    pub fn score(&self, message: &UserMessage, pmode: &ReceivingPMode) -> u32 {
        let w = &self.weights;
        let packaging = &pmode.message_packaging;
        let collaboration = &message.collaboration;
        let mut score = 0;

        if !pmode.id.is_empty()
            && collaboration
                .agreement_ref
                .as_ref()
                .and_then(|agreement| agreement.pmode_id.as_deref())
                == Some(pmode.id.as_str())
        {
            score += w.pmode_id;
        }

        let from_ids = constrains_ids(&packaging.party_info.from);
        let to_ids = constrains_ids(&packaging.party_info.to);
        if from_ids.is_some() || to_ids.is_some() {
            let from_ok = from_ids.map_or(true, |p| party_ids_match(p, &message.sender));
            let to_ok = to_ids.map_or(true, |p| party_ids_match(p, &message.receiver));
            if from_ok && to_ok {
                score += w.party;
            }
        }

        let from_role = constrains_role(&packaging.party_info.from);
        let to_role = constrains_role(&packaging.party_info.to);
        if from_role.is_some() || to_role.is_some() {
            let from_ok = from_role.map_or(true, |role| role == message.sender.role);
            let to_ok = to_role.map_or(true, |role| role == message.receiver.role);
            if from_ok && to_ok {
                score += w.role;
            }
        }

        if let Some(service) = packaging
            .collaboration
            .service
            .as_ref()
            .filter(|s| !s.value.is_empty())
        {
            let actual = &collaboration.service;
            if actual.value == service.value
                && (service.service_type.is_none() || actual.service_type == service.service_type)
            {
                score += w.service;
            }
        }

        if let Some(action) = non_empty(&packaging.collaboration.action) {
            if action == collaboration.action {
                score += w.action;
            }
        }

        if let Some(agreement) = packaging
            .collaboration
            .agreement_ref
            .as_ref()
            .filter(|a| !a.value.is_empty())
        {
            let matched = collaboration.agreement_ref.as_ref().map_or(false, |actual| {
                actual.value == agreement.value
                    && (agreement.agreement_type.is_none()
                        || actual.agreement_type == agreement.agreement_type)
            });
            if matched {
                score += w.agreement;
            }
        }

        if let Some(mpc) = non_empty(&packaging.mpc) {
            if mpc == message.mpc {
                score += w.mpc;
            }
        }

        score
    }

    /// Score table for every PMode, highest first (ties ordered by id)
    pub fn resolve_with_scores(
        &self,
        message: &UserMessage,
        pmodes: &[Arc<ReceivingPMode>],
    ) -> Vec<PModeScore> {
        let mut scores: Vec<PModeScore> = pmodes
            .iter()
            .map(|pmode| PModeScore {
                pmode_id: pmode.id.clone(),
                score: self.score(message, pmode),
            })
            .collect();
        scores.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.pmode_id.cmp(&b.pmode_id)));
        scores
    }

    /// Bind the single best receiving PMode
    pub fn resolve(
        &self,
        message: &UserMessage,
        pmodes: &[Arc<ReceivingPMode>],
    ) -> Result<Arc<ReceivingPMode>, ResolutionError> {
        let scored: Vec<(u32, &Arc<ReceivingPMode>)> = pmodes
            .iter()
            .map(|pmode| (self.score(message, pmode), pmode))
            .filter(|(score, _)| *score >= self.weights.threshold)
            .collect();

        let best = match scored.iter().map(|(score, _)| *score).max() {
            Some(best) => best,
            None => {
                warn!(message_id = %message.message_id, "No receiving PMode reaches the threshold");
                return Err(ResolutionError::NoMatchingPMode {
                    message_id: message.message_id.clone(),
                });
            }
        };

        let mut winners: Vec<&Arc<ReceivingPMode>> = scored
            .iter()
            .filter(|(score, _)| *score == best)
            .map(|(_, pmode)| *pmode)
            .collect();

        if winners.len() > 1 {
            let mut candidates: Vec<String> = winners.iter().map(|p| p.id.clone()).collect();
            candidates.sort();
            warn!(
                message_id = %message.message_id,
                score = best,
                ?candidates,
                "Ambiguous receiving PMode"
            );
            return Err(ResolutionError::AmbiguousPMode {
                message_id: message.message_id.clone(),
                candidates,
                score: best,
            });
        }

        let bound = winners.remove(0).clone();
        debug!(message_id = %message.message_id, pmode = %bound.id, score = best, "Receiving PMode bound");
        Ok(bound)
    }
}

// ----------------------------------------------------------------------------
// Signal Resolution
// ----------------------------------------------------------------------------

/// Sending PMode governing a received receipt or error
///
/// Looks up the most recent non-intermediary outbound record with the
/// referenced id. Multi-hop signals may arrive for messages this MSH never
/// sent, in which case `None` is returned instead of an error.
pub async fn resolve_signal_pmode(
    ledger: &dyn Ledger,
    signal: &SignalMessage,
) -> MshResult<Option<Arc<SendingPMode>>> {
    let ref_to = match signal.ref_to_message_id() {
        Some(ref_to) if !ref_to.is_empty() => ref_to,
        _ if signal.is_multihop() => return Ok(None),
        _ => {
            return Err(MshError::protocol_violation(
                crate::message::ErrorCode::InvalidHeader,
                format!("Signal {} has no RefToMessageId", signal.message_id()),
            ))
        }
    };

    let record = ledger.latest_out_message(ref_to).await?;
    let snapshot = record.and_then(|r| r.pmode_snapshot);

    match snapshot {
        Some(snapshot) => {
            let pmode: SendingPMode = from_snapshot(&snapshot).map_err(crate::errors::LedgerError::from)?;
            Ok(Some(Arc::new(pmode)))
        }
        None if signal.is_multihop() => {
            debug!(ref_to, "Multi-hop signal without stored sending PMode");
            Ok(None)
        }
        None => Err(ResolutionError::NoSendingPMode {
            ref_to_message_id: ref_to.to_string(),
        }
        .into()),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
