// Copyright © Palisade Contributors
// SPDX-License-Identifier: Apache-2.0

//! Parallel cryptographic validation.
//!
//! Signature and credential checks are the expensive part of vote handling,
//! so they run on a bounded pool of tasks off the player thread. Results
//! come back as authenticated events on the demux's event channel; order is
//! best-effort, which is safe because vote aggregation commutes.

use crate::{
    events::ExternalEvent,
    ledger::{membership_of, BlockValidator, LedgerReader},
};
use palisade_agreement_types::{
    Membership, PeerHandle, Step, Tag, TransmittedPayload, UnauthenticatedBundle,
    UnauthenticatedVote,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Upper bound on concurrently running verification tasks.
const VERIFIER_PARALLELISM: usize = 8;

pub struct AsyncVerifier {
    ledger: Arc<dyn LedgerReader>,
    validator: Arc<dyn BlockValidator>,
    out: mpsc::UnboundedSender<ExternalEvent>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
}

impl AsyncVerifier {
    pub fn new(
        ledger: Arc<dyn LedgerReader>,
        validator: Arc<dyn BlockValidator>,
        out: mpsc::UnboundedSender<ExternalEvent>,
    ) -> AsyncVerifier {
        AsyncVerifier {
            ledger,
            validator,
            out,
            semaphore: Arc::new(Semaphore::new(VERIFIER_PARALLELISM)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Verification jobs submitted but not yet posted back.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn submit_vote(&self, vote: UnauthenticatedVote, source: Option<PeerHandle>) {
        let ledger = Arc::clone(&self.ledger);
        self.spawn(Tag::Vote, source, move || {
            let membership = membership_of(ledger.as_ref(), vote.raw.sender, vote.raw.round)
                .map_err(|e| e.to_string())?;
            let vote = vote.verify(&membership).map_err(|e| e.to_string())?;
            Ok(ExternalEvent::Vote { vote, source })
        });
    }

    pub fn submit_bundle(&self, bundle: UnauthenticatedBundle, source: Option<PeerHandle>) {
        let ledger = Arc::clone(&self.ledger);
        self.spawn(Tag::VoteBundle, source, move || {
            let round = bundle.round;
            let lookup = |address| -> Option<Membership> {
                membership_of(ledger.as_ref(), address, round).ok()
            };
            let bundle = bundle.verify(lookup).map_err(|e| e.to_string())?;
            Ok(ExternalEvent::Bundle { bundle, source })
        });
    }

    pub fn submit_payload(&self, payload: TransmittedPayload, source: Option<PeerHandle>) {
        let ledger = Arc::clone(&self.ledger);
        let validator = Arc::clone(&self.validator);
        self.spawn(Tag::ProposalPayload, source, move || {
            let TransmittedPayload { proposal, prior_vote } = payload;
            if prior_vote.raw.step != Step::PROPOSE
                || prior_vote.raw.round != proposal.block.round
                || prior_vote.raw.proposal != proposal.value()
                || prior_vote.raw.sender != proposal.original_proposer
            {
                return Err("payload does not match its introducing vote".to_string());
            }
            let membership =
                membership_of(ledger.as_ref(), prior_vote.raw.sender, prior_vote.raw.round)
                    .map_err(|e| e.to_string())?;
            let prior_vote = prior_vote.verify(&membership).map_err(|e| e.to_string())?;
            validator.validate(&proposal.block).map_err(|e| e.to_string())?;
            Ok(ExternalEvent::Payload { proposal, prior_vote, source })
        });
    }

    fn spawn<F>(&self, tag: Tag, source: Option<PeerHandle>, job: F)
    where
        F: FnOnce() -> Result<ExternalEvent, String> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let pending = Arc::clone(&self.pending);
        let out = self.out.clone();
        pending.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only fails if
            // the whole runtime is tearing down.
            let Ok(_permit) = semaphore.acquire().await else {
                pending.fetch_sub(1, Ordering::Relaxed);
                return;
            };
            let event = match job() {
                Ok(event) => event,
                Err(reason) => ExternalEvent::VerificationFailed { tag, source, reason },
            };
            // Post before unaccounting, so the job is visible either in the
            // pending count or in the event queue at every instant.
            let _ = out.send(event);
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
