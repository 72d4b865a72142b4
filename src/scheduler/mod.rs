use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::handshake::ConnectReply;
use crate::harvest::HarvestKind;

/// One cadence tick emitted by a scheduler timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestTick {
    pub kind: HarvestKind,
}

/// Resolves the timer set for one Run.
///
/// When every event kind reports on the default cadence a single unified
/// timer harvests everything; otherwise the default group and each event
/// kind get their own independently cancellable timer.
pub fn cadence_timers(reply: &ConnectReply, default: Duration) -> Vec<(HarvestKind, Duration)> {
    if reply.unified_cadence(default) {
        return vec![(HarvestKind::All, default)];
    }

    vec![
        (HarvestKind::Default, default),
        (
            HarvestKind::AnalyticEvents,
            reply.report_period(HarvestKind::AnalyticEvents, default),
        ),
        (
            HarvestKind::CustomEvents,
            reply.report_period(HarvestKind::CustomEvents, default),
        ),
        (
            HarvestKind::ErrorEvents,
            reply.report_period(HarvestKind::ErrorEvents, default),
        ),
        (
            HarvestKind::SpanEvents,
            reply.report_period(HarvestKind::SpanEvents, default),
        ),
    ]
}

/// Periodic harvest timers for one Run.
///
/// Each timer is its own task writing ticks to a bounded outbound queue;
/// timers never touch harvest state. Teardown is a two-step handshake:
/// `shutdown` requests cancellation and then awaits every timer task's
/// join as the explicit acknowledgment, so no tick can be emitted once
/// teardown proceeds.
pub struct HarvestScheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HarvestScheduler {
    /// Spawns one timer task per entry and returns the tick queue. The
    /// queue closes once every timer has exited.
    pub fn spawn(timers: Vec<(HarvestKind, Duration)>) -> (Self, mpsc::Receiver<HarvestTick>) {
        let cancel = CancellationToken::new();
        let (tick_tx, tick_rx) = mpsc::channel(16);

        let mut tasks = Vec::with_capacity(timers.len());
        for (kind, period) in timers {
            let cancel = cancel.clone();
            let tick_tx = tick_tx.clone();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first interval tick completes immediately; a harvest
                // at time zero would always be empty.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(kind = kind.as_str(), "harvest timer stopped");
                            return;
                        }
                        _ = ticker.tick() => {
                            if tick_tx.send(HarvestTick { kind }).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        (Self { cancel, tasks }, tick_rx)
    }

    /// Cancellation handshake: request, then await each timer's join as the
    /// acknowledgment.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(json: serde_json::Value) -> ConnectReply {
        serde_json::from_value(json).expect("reply parses")
    }

    #[test]
    fn test_unified_cadence_single_timer() {
        let r = reply(serde_json::json!({"agent_run_id": "R1"}));
        let timers = cadence_timers(&r, Duration::from_secs(60));

        assert_eq!(timers, vec![(HarvestKind::All, Duration::from_secs(60))]);
    }

    #[test]
    fn test_overridden_cadence_per_kind_timers() {
        let r = reply(serde_json::json!({
            "agent_run_id": "R1",
            "event_harvest_config": {"report_period_ms": 5000}
        }));
        let timers = cadence_timers(&r, Duration::from_secs(60));

        assert_eq!(timers.len(), 5);
        assert_eq!(timers[0], (HarvestKind::Default, Duration::from_secs(60)));
        for (kind, period) in &timers[1..] {
            assert_ne!(*kind, HarvestKind::Default);
            assert_eq!(*period, Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_ticks_arrive_on_cadence() {
        let (scheduler, mut ticks) =
            HarvestScheduler::spawn(vec![(HarvestKind::All, Duration::from_millis(20))]);

        let tick = tokio::time::timeout(Duration::from_millis(500), ticks.recv())
            .await
            .expect("tick within deadline")
            .expect("queue open");
        assert_eq!(tick.kind, HarvestKind::All);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_tick_queue() {
        let (scheduler, mut ticks) =
            HarvestScheduler::spawn(vec![(HarvestKind::All, Duration::from_millis(10))]);

        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.shutdown().await;

        // Queued ticks may remain; the channel must close and stay closed,
        // proving no timer can fire after the handshake completed.
        while let Some(_tick) = ticks.recv().await {}
    }

    #[tokio::test]
    async fn test_no_tick_before_first_period() {
        let (scheduler, mut ticks) =
            HarvestScheduler::spawn(vec![(HarvestKind::All, Duration::from_millis(200))]);

        let early = tokio::time::timeout(Duration::from_millis(40), ticks.recv()).await;
        assert!(early.is_err(), "no tick should fire immediately");

        scheduler.shutdown().await;
    }
}
