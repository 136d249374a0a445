//! Fixed-text generator.

use super::Generator;
use crate::plot::{AnswerState, Question, Task, TaskError};
use bytes::Bytes;
use std::io::Read;

/// Generator whose tasks show the same text and accept anything.
///
/// The text is shared by every task (and every client, when the plot
/// constructor hands out clones of the same `Bytes`).
#[derive(Debug, Clone)]
pub struct BannerGenerator {
    text: Bytes,
}

impl BannerGenerator {
    pub fn new(text: impl Into<Bytes>) -> Self {
        Self { text: text.into() }
    }
}

impl Generator for BannerGenerator {
    fn generate(&mut self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(BannerTask {
            text: self.text.clone(),
        }))
    }
}

struct BannerTask {
    text: Bytes,
}

impl Task for BannerTask {
    fn question(&mut self) -> Result<Question, TaskError> {
        Ok(Question::new(self.text.clone()))
    }

    fn check(&mut self, _answer: &mut dyn Read) -> AnswerState {
        AnswerState::Right
    }
}
