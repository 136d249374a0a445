//! Staged plot: a fixed sequence of generators, each used for a set number
//! of tasks with a shrinking reply deadline.

use super::{Plot, PlotTask, TaskError};
use crate::generators::Generator;
use std::collections::VecDeque;

/// One stage of a [`LinearPlot`].
pub struct Stage {
    generator: Box<dyn Generator>,
    tasks: u32,
    timeout_base_ms: u64,
    timeout_dec_ms: u64,
}

impl Stage {
    /// # Arguments
    ///
    /// * `generator` - source of this stage's tasks
    /// * `tasks` - number of tasks the stage hands out
    /// * `timeout_base_ms` - deadline of the stage's first task, 0 for none
    /// * `timeout_dec_ms` - how much shorter each following deadline gets
    pub fn new(
        generator: Box<dyn Generator>,
        tasks: u32,
        timeout_base_ms: u64,
        timeout_dec_ms: u64,
    ) -> Self {
        Self {
            generator,
            tasks,
            timeout_base_ms,
            timeout_dec_ms,
        }
    }

    /// Deadline of the `n`-th task of this stage (0-based).
    ///
    /// Saturates at 0, which means "no deadline".
    fn timeout_ms(&self, n: u32) -> u64 {
        self.timeout_base_ms
            .saturating_sub(u64::from(n).saturating_mul(self.timeout_dec_ms))
    }
}

/// Plot that walks its stages in order.
///
/// A stage is dropped, generator included, as soon as it has handed out
/// its last task.
pub struct LinearPlot {
    stages: VecDeque<Stage>,
    issued: u32,
}

impl LinearPlot {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages: stages.into_iter().filter(|s| s.tasks > 0).collect(),
            issued: 0,
        }
    }
}

impl Plot for LinearPlot {
    fn next_task(&mut self) -> Result<Option<PlotTask>, TaskError> {
        let Some(stage) = self.stages.front_mut() else {
            return Ok(None);
        };

        let task = stage.generator.generate()?;
        let timeout_ms = stage.timeout_ms(self.issued);

        self.issued += 1;
        if self.issued == stage.tasks {
            self.stages.pop_front();
            self.issued = 0;
        }

        Ok(Some(PlotTask::new(task, timeout_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::testing::ExpectTask;
    use crate::plot::Task;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Generator that counts calls, flags its own drop and can be told to fail.
    struct Probe {
        calls: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
    }

    impl Generator for Probe {
        fn generate(&mut self) -> Result<Box<dyn Task>, TaskError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TaskError::Generation("probe".into()));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ExpectTask::new("q", b"a")))
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ProbeHandles {
        calls: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
    }

    impl ProbeHandles {
        fn probe(&self) -> Box<dyn Generator> {
            Box::new(Probe {
                calls: self.calls.clone(),
                dropped: self.dropped.clone(),
                fail: self.fail.clone(),
            })
        }
    }

    fn timeouts(plot: &mut LinearPlot) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(task) = plot.next_task().unwrap() {
            out.push(task.timeout_ms());
        }
        out
    }

    #[test]
    fn test_stage_timeouts_decrease() {
        let h = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![
            Stage::new(h.probe(), 3, 1000, 100),
            Stage::new(h.probe(), 2, 500, 0),
        ]);

        assert_eq!(timeouts(&mut plot), vec![1000, 900, 800, 500, 500]);
        assert_eq!(h.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_timeout_saturates_to_none() {
        let h = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![Stage::new(h.probe(), 4, 250, 100)]);

        assert_eq!(timeouts(&mut plot), vec![250, 150, 50, 0]);
    }

    #[test]
    fn test_exhausted_plot_stays_exhausted() {
        let h = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![Stage::new(h.probe(), 1, 0, 0)]);

        assert!(plot.next_task().unwrap().is_some());
        assert!(plot.next_task().unwrap().is_none());
        assert!(plot.next_task().unwrap().is_none());
    }

    #[test]
    fn test_finished_stage_drops_generator() {
        let first = ProbeHandles::default();
        let second = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![
            Stage::new(first.probe(), 2, 0, 0),
            Stage::new(second.probe(), 1, 0, 0),
        ]);

        plot.next_task().unwrap();
        assert!(!first.dropped.load(Ordering::SeqCst));

        plot.next_task().unwrap();
        assert!(first.dropped.load(Ordering::SeqCst));
        assert!(!second.dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_generator_failure_does_not_advance() {
        let h = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![Stage::new(h.probe(), 2, 1000, 100)]);

        h.fail.store(true, Ordering::SeqCst);
        assert!(matches!(plot.next_task(), Err(TaskError::Generation(_))));

        h.fail.store(false, Ordering::SeqCst);
        assert_eq!(timeouts(&mut plot), vec![1000, 900]);
    }

    #[test]
    fn test_empty_stages_are_skipped() {
        let h = ProbeHandles::default();
        let mut plot = LinearPlot::new(vec![
            Stage::new(h.probe(), 0, 1, 0),
            Stage::new(h.probe(), 1, 7, 0),
        ]);

        assert_eq!(timeouts(&mut plot), vec![7]);
        assert!(LinearPlot::new(Vec::new()).next_task().unwrap().is_none());
    }
}
