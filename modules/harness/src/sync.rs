//! Barriers and outcome checks.
//!
//! The protocol has no "done processing" signal, so every wait here is a
//! bounded poll: drain inbound events, test a predicate over all peer views,
//! sleep, repeat. Running out of time is fatal for the test case.

use std::{sync::Arc, time::Duration};

use lockstep_common::{BlockHash, NodeController, TxHash};
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument, warn};

use crate::{
    Harness,
    error::HarnessError,
    outcome::{Outcome, Verdict},
    test_peer::{PeerView, TestPeer},
};

/// Floor for the block request wait, scaled with the number of objects.
pub(crate) fn block_request_timeout(count: usize, floor: Option<Duration>) -> Duration {
    let scaled = Duration::from_secs_f64(0.05 * count as f64) + Duration::from_secs(30);
    floor.map_or(scaled, |floor| floor.max(scaled))
}

pub(crate) fn tx_request_timeout(count: usize) -> Duration {
    Duration::from_secs(3 * count as u64 + 30)
}

impl Harness {
    pub(crate) fn next_nonce(&mut self) -> u64 {
        let nonce = self.next_ping_nonce;
        self.next_ping_nonce += 1;
        nonce
    }

    /// Poll until `done` holds for the peer set or `timeout` elapses.
    pub(crate) async fn wait_until(
        &mut self,
        predicate: &'static str,
        timeout: Duration,
        mut done: impl FnMut(&[TestPeer]) -> bool,
    ) -> Result<(), HarnessError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_all_events()?;
            if done(&self.peers) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("gave up after {timeout:?} waiting for {predicate}");
                return Err(HarnessError::SyncTimeout { predicate, timeout });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Ping every peer and wait for all pongs, then for every node that
    /// exposes a controller to report no work in flight. Both waits share
    /// one deadline.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn ping_barrier(&mut self, timeout: Duration) -> Result<(), HarnessError> {
        let deadline = Instant::now() + timeout;
        let nonce = self.next_nonce();
        for peer in &mut self.peers {
            peer.send_ping(nonce)?;
        }
        self.wait_until("pong received", timeout, |peers| {
            peers.iter().all(|peer| peer.view().received_ping_response(nonce))
        })
        .await?;
        self.wait_for_idle(deadline, timeout).await
    }

    async fn wait_for_idle(&mut self, deadline: Instant, timeout: Duration) -> Result<(), HarnessError> {
        let controllers: Vec<(String, Arc<dyn NodeController>)> = self
            .peers
            .iter()
            .filter_map(|peer| {
                let controller = peer.connection().controller()?;
                Some((peer.name().to_string(), controller.clone()))
            })
            .collect();
        if controllers.is_empty() {
            return Ok(());
        }

        loop {
            self.process_all_events()?;
            let mut in_flight = 0;
            for (peer, controller) in &controllers {
                in_flight += controller.pending_work_count().await.map_err(|e| {
                    HarnessError::Controller {
                        peer: peer.clone(),
                        detail: format!("{e:#}"),
                    }
                })?;
            }
            if in_flight == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(in_flight, "nodes still busy after {timeout:?}");
                return Err(HarnessError::SyncTimeout {
                    predicate: "nodes idle",
                    timeout,
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Wait for every node to request `hash`, settle, then refresh each
    /// peer's best tip with `getheaders` and settle again.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn sync_blocks(
        &mut self,
        hash: BlockHash,
        count: usize,
        timeout: Duration,
        request_floor: Option<Duration>,
    ) -> Result<(), HarnessError> {
        self.wait_until(
            "block requested",
            block_request_timeout(count, request_floor),
            |peers| peers.iter().all(|peer| peer.view().block_requested(&hash)),
        )
        .await?;
        self.ping_barrier(timeout).await?;

        for peer in &self.peers {
            peer.send_getheaders()?;
        }
        self.ping_barrier(timeout).await
    }

    /// Wait for every node to request `hash`, settle, then refresh each
    /// peer's mempool snapshot and sort it for comparison.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn sync_transaction(
        &mut self,
        hash: TxHash,
        count: usize,
    ) -> Result<(), HarnessError> {
        self.wait_until("transaction requested", tx_request_timeout(count), |peers| {
            peers.iter().all(|peer| peer.view().tx_requested(&hash))
        })
        .await?;
        let timeout = self.config.ping_timeout();
        self.ping_barrier(timeout).await?;

        for peer in &mut self.peers {
            peer.send_mempool()?;
        }
        self.ping_barrier(timeout).await?;

        for peer in &mut self.peers {
            peer.view_mut().last_inv.sort();
        }
        Ok(())
    }

    /// Judge every peer against `outcome`. A reject that has not arrived yet
    /// is retried a bounded number of times; anything else is final.
    pub(crate) async fn check_block_outcome(
        &mut self,
        tip: &BlockHash,
        outcome: &Outcome,
    ) -> Result<(), HarnessError> {
        let mut attempt = 1;
        loop {
            self.process_all_events()?;
            match self.evaluate(|view, reference| outcome.evaluate_block(tip, view, reference)) {
                Verdict::Pass => return Ok(()),
                Verdict::Fail(reason) => return Err(HarnessError::OutcomeMismatch(reason)),
                Verdict::Pending(reason) if attempt >= self.config.reject_retries => {
                    return Err(HarnessError::OutcomeMismatch(reason));
                }
                Verdict::Pending(reason) => {
                    debug!(attempt, "{reason}, retrying");
                    attempt += 1;
                    sleep(self.config.reject_retry_delay()).await;
                }
            }
        }
    }

    /// Transactions are checked once, right after the mempool refresh.
    pub(crate) fn check_mempool(&self, hash: &TxHash, outcome: &Outcome) -> Result<(), HarnessError> {
        match self.evaluate(|view, reference| outcome.evaluate_tx(hash, view, reference)) {
            Verdict::Pass => Ok(()),
            Verdict::Pending(reason) | Verdict::Fail(reason) => {
                Err(HarnessError::OutcomeMismatch(reason))
            }
        }
    }

    /// Combine per-peer verdicts: any failure wins, then any pending.
    fn evaluate(&self, judge: impl Fn(&PeerView, &PeerView) -> Verdict) -> Verdict {
        let Some(reference) = self.peers.first() else {
            return Verdict::Pass;
        };
        let mut pending = None;
        for peer in &self.peers {
            match judge(peer.view(), reference.view()) {
                Verdict::Pass => {}
                Verdict::Pending(reason) => {
                    pending.get_or_insert_with(|| format!("{}: {reason}", peer.name()));
                }
                Verdict::Fail(reason) => return Verdict::Fail(format!("{}: {reason}", peer.name())),
            }
        }
        pending.map_or(Verdict::Pass, Verdict::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_request_timeout_scales_with_count() {
        assert_eq!(block_request_timeout(1, None), Duration::from_millis(30_050));
        assert_eq!(block_request_timeout(200, None), Duration::from_secs(40));
    }

    #[test]
    fn block_request_timeout_override_is_a_floor() {
        let long = Duration::from_secs(120);
        assert_eq!(block_request_timeout(1, Some(long)), long);
        assert_eq!(
            block_request_timeout(200, Some(Duration::from_secs(1))),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn tx_request_timeout_scales_with_count() {
        assert_eq!(tx_request_timeout(1), Duration::from_secs(33));
        assert_eq!(tx_request_timeout(10), Duration::from_secs(60));
    }
}
