use std::time::{Duration, Instant};

use crate::criu::cr_restore::StageId;

#[derive(Clone, Copy)]
struct Timing {
    stage: StageId,
    start: Option<Instant>,
    total: Duration,
}

/// Wall time spent in each pipeline stage.
#[derive(Default)]
pub struct RestoreStats {
    timings: Vec<Timing>,
}

impl RestoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn timing(&mut self, stage: StageId) -> &mut Timing {
        let idx = match self.timings.iter().position(|t| t.stage == stage) {
            Some(idx) => idx,
            None => {
                self.timings.push(Timing {
                    stage,
                    start: None,
                    total: Duration::ZERO,
                });
                self.timings.len() - 1
            }
        };
        &mut self.timings[idx]
    }

    pub fn timing_start(&mut self, stage: StageId) {
        self.timing(stage).start = Some(Instant::now());
    }

    /// Accumulates the time since the matching `timing_start`.
    pub fn timing_stop(&mut self, stage: StageId) {
        let t = self.timing(stage);
        if let Some(start) = t.start.take() {
            t.total += start.elapsed();
        }
    }

    pub fn total(&self, stage: StageId) -> Option<Duration> {
        self.timings.iter().find(|t| t.stage == stage).map(|t| t.total)
    }

    pub fn overall(&self) -> Duration {
        self.timings.iter().map(|t| t.total).sum()
    }

    pub fn display_stats(&self) {
        log::info!("Displaying restore stats:");
        for t in &self.timings {
            log::info!("{} time: {} us", t.stage, t.total.as_micros());
        }
        log::info!("Total time: {} us", self.overall().as_micros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_per_stage() {
        let mut stats = RestoreStats::new();

        stats.timing_start(StageId::Inventory);
        std::thread::sleep(Duration::from_millis(2));
        stats.timing_stop(StageId::Inventory);
        let first = stats.total(StageId::Inventory).unwrap();
        assert!(first >= Duration::from_millis(2));

        stats.timing_start(StageId::Inventory);
        stats.timing_stop(StageId::Inventory);
        assert!(stats.total(StageId::Inventory).unwrap() >= first);

        assert!(stats.total(StageId::NetworkLock).is_none());
        assert_eq!(stats.overall(), stats.total(StageId::Inventory).unwrap());
    }

    #[test]
    fn test_stop_without_start() {
        let mut stats = RestoreStats::new();
        stats.timing_stop(StageId::DeleteRemaps);
        assert_eq!(stats.total(StageId::DeleteRemaps), Some(Duration::ZERO));
    }
}
