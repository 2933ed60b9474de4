use std::collections::{HashSet, VecDeque};

use message_bus::DeliveryToken;

/// Bounded memory of deliveries this instance already applied.
///
/// A token is claimed before its handler runs and remembered only after the
/// write succeeded, so a failed attempt never masks a later redelivery. The
/// oldest token is forgotten once `capacity` is exceeded.
/// Result of claiming a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The caller owns the delivery and must release it.
    Claimed,
    /// The delivery was already written by this instance.
    Applied,
    /// Another handler of this instance holds the delivery and its outcome is
    /// still open.
    InFlight,
}

#[derive(Debug)]
pub(crate) struct DedupeWindow {
    capacity: usize,
    applied: HashSet<DeliveryToken>,
    order: VecDeque<DeliveryToken>,
    in_flight: HashSet<DeliveryToken>,
}

impl DedupeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            applied: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            in_flight: HashSet::new(),
        }
    }

    /// Claims `token` for processing.
    pub(crate) fn claim(&mut self, token: DeliveryToken) -> Claim {
        if self.capacity == 0 {
            return Claim::Claimed;
        }
        if self.applied.contains(&token) {
            Claim::Applied
        } else if self.in_flight.insert(token) {
            Claim::Claimed
        } else {
            Claim::InFlight
        }
    }

    /// Releases a claim, remembering the token if its write succeeded.
    pub(crate) fn release(&mut self, token: DeliveryToken, applied: bool) {
        if self.capacity == 0 {
            return;
        }
        self.in_flight.remove(&token);
        if !applied || !self.applied.insert(token) {
            return;
        }
        self.order.push_back(token);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.applied.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.applied.len()
    }
}
