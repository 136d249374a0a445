//! Random-token echo generator.
//!
//! Each task shows a prefix followed by a fresh random token of printable
//! ASCII and expects the token back byte for byte. The reply may arrive in
//! any number of pieces; pieces are collected in a `ByteStream` until the
//! full token length is available.

use super::Generator;
use crate::plot::{AnswerState, Question, Task, TaskError};
use crate::runtime::ByteStream;
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Read;

/// Length of the token a client has to send back.
pub const TOKEN_LEN: usize = 32;

/// Generator of echo tasks.
#[derive(Debug)]
pub struct EchoGenerator {
    prefix: Bytes,
    rng: StdRng,
}

impl EchoGenerator {
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic token sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl Generator for EchoGenerator {
    fn generate(&mut self) -> Result<Box<dyn Task>, TaskError> {
        let mut token = [0u8; TOKEN_LEN];
        for byte in token.iter_mut() {
            *byte = self.rng.gen_range(b'!'..=b'~');
        }

        Ok(Box::new(EchoTask {
            prefix: self.prefix.clone(),
            token,
            text: None,
            received: ByteStream::new(),
        }))
    }
}

struct EchoTask {
    prefix: Bytes,
    token: [u8; TOKEN_LEN],
    text: Option<Bytes>,
    received: ByteStream,
}

impl Task for EchoTask {
    fn question(&mut self) -> Result<Question, TaskError> {
        let text = self.text.get_or_insert_with(|| {
            let mut text = BytesMut::with_capacity(self.prefix.len() + TOKEN_LEN);
            text.extend_from_slice(&self.prefix);
            text.extend_from_slice(&self.token);
            text.freeze()
        });

        Ok(Question::new(text.clone()))
    }

    fn check(&mut self, answer: &mut dyn Read) -> AnswerState {
        let needed = TOKEN_LEN - self.received.len();
        let got = self.received.write_from(answer, needed);
        if got < needed {
            return AnswerState::More;
        }

        let mut reply = [0u8; TOKEN_LEN];
        let n = self.received.read_into(&mut reply);
        debug_assert_eq!(n, TOKEN_LEN);

        if reply == self.token {
            AnswerState::Right
        } else {
            AnswerState::Wrong
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_of(task: &mut Box<dyn Task>, prefix: &[u8]) -> Vec<u8> {
        let question = task.question().unwrap();
        let text = question.text();
        assert!(text.starts_with(prefix));
        text[prefix.len()..].to_vec()
    }

    #[test]
    fn test_echo_question_format() {
        let mut generator = EchoGenerator::new("Echo: ").with_seed(7);
        let mut task = generator.generate().unwrap();

        let token = token_of(&mut task, b"Echo: ");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.iter().all(|b| (b'!'..=b'~').contains(b)));
    }

    #[test]
    fn test_echo_question_is_cached() {
        let mut generator = EchoGenerator::new("Echo: ").with_seed(7);
        let mut task = generator.generate().unwrap();

        let first = task.question().unwrap();
        let second = task.question().unwrap();
        assert_eq!(first.text().as_ptr(), second.text().as_ptr());
    }

    #[test]
    fn test_echo_accepts_token_in_pieces() {
        let mut generator = EchoGenerator::new("").with_seed(1);
        let mut task = generator.generate().unwrap();
        let token = token_of(&mut task, b"");

        assert_eq!(task.check(&mut &token[..10]), AnswerState::More);
        assert_eq!(task.check(&mut &b""[..]), AnswerState::More);
        assert_eq!(task.check(&mut &token[10..]), AnswerState::Right);
    }

    #[test]
    fn test_echo_rejects_wrong_token() {
        let mut generator = EchoGenerator::new("").with_seed(1);
        let mut task = generator.generate().unwrap();
        let mut token = token_of(&mut task, b"");
        token[TOKEN_LEN - 1] = if token[TOKEN_LEN - 1] == b'!' { b'~' } else { b'!' };

        assert_eq!(task.check(&mut &token[..]), AnswerState::Wrong);
    }

    #[test]
    fn test_echo_does_not_consume_past_token() {
        let mut generator = EchoGenerator::new("").with_seed(3);
        let mut task = generator.generate().unwrap();
        let mut reply = token_of(&mut task, b"");
        reply.extend_from_slice(b"next");

        let mut input = &reply[..];
        assert_eq!(task.check(&mut input), AnswerState::Right);
        assert_eq!(input, b"next");
    }

    #[test]
    fn test_echo_tokens_differ() {
        let mut generator = EchoGenerator::new("").with_seed(11);
        let mut a = generator.generate().unwrap();
        let mut b = generator.generate().unwrap();

        assert_ne!(token_of(&mut a, b""), token_of(&mut b, b""));
    }
}
