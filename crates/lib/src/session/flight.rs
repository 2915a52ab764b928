//! Singleflight completion barriers.
//!
//! Each target gets at most one flight per session: a single-assignment
//! barrier created when the target is claimed and fulfilled exactly once by
//! the worker that won the claim. Every other requester observes the same
//! outcome instead of re-invoking the toolchain. This is what collapses
//! concurrent demand for a shared dependency into one build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::artifact::Artifact;
use crate::target::TargetId;

use super::BuildError;

/// The shared outcome of a target's build, observed by every requester.
pub(crate) type FlightOutcome = Result<Arc<Artifact>, Arc<BuildError>>;

/// Result of trying to claim a target's flight.
pub(crate) enum Claim {
  /// This claimer executes the build and must fulfill the barrier.
  Owner(FlightHandle),
  /// Someone else owns the build; await the shared outcome instead.
  Follower(watch::Receiver<Option<FlightOutcome>>),
}

/// The owning side of a flight. Consumed by fulfillment, so an outcome can
/// be assigned only once.
pub(crate) struct FlightHandle {
  tx: watch::Sender<Option<FlightOutcome>>,
}

impl FlightHandle {
  pub fn fulfill(self, outcome: FlightOutcome) {
    // Receivers may all be gone; an unobserved outcome is fine.
    let _ = self.tx.send(Some(outcome));
  }
}

/// All flights of one session.
#[derive(Default)]
pub(crate) struct FlightBoard {
  flights: Mutex<HashMap<TargetId, watch::Receiver<Option<FlightOutcome>>>>,
}

impl FlightBoard {
  /// Claim the flight for `id`. The first claimer becomes the owner; every
  /// later claimer gets a follower handle on the same barrier.
  pub fn claim(&self, id: &TargetId) -> Claim {
    let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(rx) = flights.get(id) {
      return Claim::Follower(rx.clone());
    }

    let (tx, rx) = watch::channel(None);
    flights.insert(id.clone(), rx);
    Claim::Owner(FlightHandle { tx })
  }

  /// Await a follower handle until the owner fulfills the flight.
  ///
  /// Returns `None` only if the owner dropped without fulfilling, which the
  /// executor treats as a failed build.
  pub async fn wait(mut rx: watch::Receiver<Option<FlightOutcome>>) -> Option<FlightOutcome> {
    loop {
      let current = rx.borrow().clone();
      if current.is_some() {
        return current;
      }
      if rx.changed().await.is_err() {
        return rx.borrow().clone();
      }
    }
  }
}
