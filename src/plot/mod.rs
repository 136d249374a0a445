//! Content-provider capability consumed by the runtime.
//!
//! A `Plot` is one client's session script. It hands out `PlotTask`s one at
//! a time until it runs out; each task produces a `Question` and judges
//! whatever bytes the client sends back.
//!
//! The runtime only ever talks to these traits. Concrete plots are built
//! from configuration (see `linear`) out of the generators in
//! `crate::generators`.

use bytes::Bytes;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod linear;

pub use linear::{LinearPlot, Stage};

/// Verdict of an answer check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    /// The answer is wrong; the client is disconnected.
    Wrong,
    /// Not enough input yet; keep waiting.
    More,
    /// The answer is right; move on to the next task.
    Right,
}

/// Errors raised while building plots or tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A generator could not produce a task.
    #[error("task generation failed: {0}")]
    Generation(String),

    /// A plot could not be constructed for a new client.
    #[error("plot construction failed: {0}")]
    Construction(String),
}

/// Question text shown to the client.
///
/// The text is shared: cloning a `Question` or queueing it for sending only
/// bumps a reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    text: Bytes,
}

impl Question {
    pub fn new(text: impl Into<Bytes>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &Bytes {
        &self.text
    }
}

/// One question/answer round.
pub trait Task: Send {
    /// The question for this task. Implementations build the text at most
    /// once and hand out shared copies afterwards.
    fn question(&mut self) -> Result<Question, TaskError>;

    /// Judge the bytes available on `answer`.
    ///
    /// `answer` is non-blocking: a read returning 0 means nothing more has
    /// arrived yet. Checks must never block and may be called repeatedly
    /// while input trickles in.
    fn check(&mut self, answer: &mut dyn Read) -> AnswerState;
}

/// A task handed out by a plot, together with its reply deadline.
pub struct PlotTask {
    task: Box<dyn Task>,
    timeout_ms: u64,
}

impl PlotTask {
    /// Wrap `task`; a `timeout_ms` of 0 means no deadline.
    pub fn new(task: Box<dyn Task>, timeout_ms: u64) -> Self {
        Self { task, timeout_ms }
    }

    pub fn question(&mut self) -> Result<Question, TaskError> {
        self.task.question()
    }

    pub fn check(&mut self, answer: &mut dyn Read) -> AnswerState {
        self.task.check(answer)
    }

    /// Reply deadline in milliseconds, 0 for none.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Reply deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl fmt::Debug for PlotTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlotTask")
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// A client's session script.
pub trait Plot: Send {
    /// Next task, or `Ok(None)` once the script is exhausted.
    fn next_task(&mut self) -> Result<Option<PlotTask>, TaskError>;
}

/// Factory invoked once per accepted connection.
pub type PlotConstructor = Arc<dyn Fn() -> Result<Box<dyn Plot>, TaskError> + Send + Sync>;

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted plots for runtime tests.

    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Task that expects an exact byte string, accumulated across checks.
    pub struct ExpectTask {
        question: &'static str,
        expected: &'static [u8],
        received: Vec<u8>,
    }

    impl ExpectTask {
        pub fn new(question: &'static str, expected: &'static [u8]) -> Self {
            Self {
                question,
                expected,
                received: Vec::new(),
            }
        }
    }

    impl Task for ExpectTask {
        fn question(&mut self) -> Result<Question, TaskError> {
            Ok(Question::new(Bytes::from_static(self.question.as_bytes())))
        }

        fn check(&mut self, answer: &mut dyn Read) -> AnswerState {
            let mut buf = [0u8; 64];
            while self.received.len() < self.expected.len() {
                let want = (self.expected.len() - self.received.len()).min(buf.len());
                match answer.read(&mut buf[..want]) {
                    Ok(0) => break,
                    Ok(n) => self.received.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return AnswerState::Wrong,
                }
            }

            if !self.expected.starts_with(&self.received) {
                AnswerState::Wrong
            } else if self.received.len() < self.expected.len() {
                AnswerState::More
            } else {
                AnswerState::Right
            }
        }
    }

    /// Plot that replays a fixed list of `(question, answer, timeout_ms)`.
    pub struct ScriptedPlot {
        script: VecDeque<(&'static str, &'static [u8], u64)>,
    }

    impl Plot for ScriptedPlot {
        fn next_task(&mut self) -> Result<Option<PlotTask>, TaskError> {
            Ok(self.script.pop_front().map(|(question, expected, timeout_ms)| {
                PlotTask::new(Box::new(ExpectTask::new(question, expected)), timeout_ms)
            }))
        }
    }

    /// Constructor producing a fresh `ScriptedPlot` per client.
    pub fn scripted(script: Vec<(&'static str, &'static [u8], u64)>) -> PlotConstructor {
        Arc::new(move || -> Result<Box<dyn Plot>, TaskError> {
            Ok(Box::new(ScriptedPlot {
                script: script.iter().copied().collect(),
            }))
        })
    }

    #[test]
    fn test_expect_task_accumulates() {
        let mut task = ExpectTask::new("q", b"ABCD");

        assert_eq!(task.check(&mut &b"AB"[..]), AnswerState::More);
        assert_eq!(task.check(&mut &b""[..]), AnswerState::More);
        assert_eq!(task.check(&mut &b"CD"[..]), AnswerState::Right);
    }

    #[test]
    fn test_expect_task_rejects_mismatch() {
        let mut task = ExpectTask::new("q", b"ABCD");
        assert_eq!(task.check(&mut &b"AX"[..]), AnswerState::Wrong);
    }
}
