//! Admission control: accept or reject before any pipeline resources are
//! consumed.
//!
//! Rejections are cheap and never touch the batch assembler. Counters are
//! released by the result router on every terminal outcome.

use std::collections::HashMap;
use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::Mutex;

use vision_serve_common::RejectReason;

use crate::config::AdmissionConfig;

#[derive(Debug, Default)]
struct InFlight {
    total: usize,
    per_client: HashMap<String, usize>,
}

/// Gates incoming requests on in-flight ceilings, payload size, and an
/// optional per-client request rate.
pub struct AdmissionController {
    config: AdmissionConfig,
    in_flight: Mutex<InFlight>,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let limiter = config
            .per_client_rate
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::keyed(Quota::per_second(rate)));
        Self {
            config,
            in_flight: Mutex::new(InFlight::default()),
            limiter,
        }
    }

    /// Admit or reject a request. On admission both in-flight counters are
    /// incremented; the caller must guarantee a matching `release`.
    ///
    /// Constraints are checked in order: global ceiling, per-client ceiling,
    /// payload size, then the per-client request rate.
    pub async fn admit(&self, client_id: &str, payload_len: usize) -> Result<(), RejectReason> {
        let mut in_flight = self.in_flight.lock().await;

        if in_flight.total >= self.config.max_in_flight {
            return Err(RejectReason::Overloaded);
        }

        let client_count = in_flight.per_client.get(client_id).copied().unwrap_or(0);
        if client_count >= self.config.per_client_in_flight {
            return Err(RejectReason::RateLimited);
        }

        if payload_len > self.config.max_payload_bytes {
            return Err(RejectReason::PayloadTooLarge);
        }

        if let Some(limiter) = &self.limiter {
            if limiter.check_key(&client_id.to_string()).is_err() {
                return Err(RejectReason::RateLimited);
            }
        }

        in_flight.total += 1;
        *in_flight
            .per_client
            .entry(client_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Release the counters taken by an admitted request.
    pub async fn release(&self, client_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.total = in_flight.total.saturating_sub(1);
        if let Some(count) = in_flight.per_client.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.per_client.remove(client_id);
            }
        }
    }

    /// Current global in-flight count.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.total
    }
}
