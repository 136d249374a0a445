//! Arithmetic expression generator.
//!
//! Expressions are chains of elements (numbers, `+ - *` and parentheses)
//! built left to right by a small automaton that keeps track of how many
//! numbers, operators and braces the remaining slots can still hold.
//! Every candidate is evaluated with the usual precedence rules:
//!
//! ```text
//! expression := expression ('+' | '-') term | term
//! term       := term '*' primary | primary
//! primary    := number | '(' expression ')'
//! ```
//!
//! Candidates that do not parse (an unbalanced brace budget) or that
//! overflow `i128` are thrown away and regenerated.
//!
//! The client answers with a decimal integer on its own line.

use super::Generator;
use crate::plot::{AnswerState, Question, Task, TaskError};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fmt::Write as _;
use std::io::{self, Read};

/// Candidates tried per task before giving up.
const MAX_ATTEMPTS: usize = 64;

/// Longest answer line accepted, terminator excluded.
const MAX_ANSWER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Number(u64),
    Op(Op),
    Open,
    Close,
}

/// What the automaton may emit next.
#[derive(Debug, Clone, Copy)]
enum Choice {
    Number,
    Op(Op),
    Open,
    Close,
}

/// Generator of equation tasks.
#[derive(Debug)]
pub struct EquationGenerator {
    min_len: usize,
    max_len: usize,
    max_number: u64,
    braces: bool,
    rng: StdRng,
}

impl EquationGenerator {
    /// Create a generator of expressions with `min_len..=max_len` elements
    /// and numbers below `max_number`.
    ///
    /// # Panics
    ///
    /// Panics if `max_number` is 0.
    pub fn new(min_len: usize, max_len: usize, max_number: u64, braces: bool) -> Self {
        assert!(max_number > 0, "max_number must be positive");
        Self {
            min_len: min_len.max(1),
            max_len,
            max_number,
            braces,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic expression sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Pick an odd chain length in `[min_len, max_len]`.
    fn chain_len(&mut self) -> Option<usize> {
        if self.min_len > self.max_len {
            return None;
        }

        let len = self.rng.gen_range(self.min_len..=self.max_len);
        if len % 2 == 1 {
            Some(len)
        } else if len < self.max_len {
            Some(len + 1)
        } else if len > self.min_len {
            Some(len - 1)
        } else {
            None
        }
    }

    fn candidate(&mut self) -> Option<Vec<Element>> {
        let len = self.chain_len()?;
        let half = len / 2;

        // Slot budgets, signed because a brace reserves slots up front
        let mut open_avail = half as isize;
        let mut close_avail = 0isize;
        let mut op_avail = half as isize;
        let mut nr_avail = half as isize + 1;

        let mut open_ok = open_avail > 0;
        let mut close_ok = false;
        let mut op_ok = false;
        let mut nr_ok = true;

        let mut chain = Vec::with_capacity(len);
        let mut choices = Vec::with_capacity(6);

        for _ in 0..len {
            choices.clear();
            if self.braces && open_ok {
                choices.push(Choice::Open);
            }
            if self.braces && close_ok {
                choices.push(Choice::Close);
            }
            if op_ok {
                choices.extend([Choice::Op(Op::Add), Choice::Op(Op::Sub), Choice::Op(Op::Mul)]);
            }
            if nr_ok {
                choices.push(Choice::Number);
            }

            let element = match *choices.choose(&mut self.rng)? {
                Choice::Op(op) => {
                    op_avail -= 1;
                    open_ok = open_avail > 0;
                    close_ok = false;
                    op_ok = false;
                    nr_ok = nr_avail > 0;
                    Element::Op(op)
                }
                Choice::Open => {
                    open_avail -= 1;
                    close_avail += 1;
                    nr_avail -= 1;
                    // the matching close takes an operator's slot
                    op_avail -= 1;
                    open_ok = open_avail > 0;
                    close_ok = false;
                    op_ok = false;
                    nr_ok = nr_avail > 0;
                    Element::Open
                }
                Choice::Close => {
                    close_avail -= 1;
                    open_ok = false;
                    close_ok = close_avail > 0;
                    op_ok = op_avail > 0;
                    nr_ok = false;
                    Element::Close
                }
                Choice::Number => {
                    nr_avail -= 1;
                    open_avail -= 1;
                    open_ok = false;
                    close_ok = close_avail > 0;
                    op_ok = op_avail > 0;
                    nr_ok = false;
                    Element::Number(self.rng.gen_range(0..self.max_number))
                }
            };
            chain.push(element);
        }

        Some(chain)
    }
}

impl Generator for EquationGenerator {
    fn generate(&mut self) -> Result<Box<dyn Task>, TaskError> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(chain) = self.candidate() else {
                continue;
            };
            if let Some(value) = evaluate(&chain) {
                return Ok(Box::new(EquationTask::new(render(&chain), value)));
            }
        }

        Err(TaskError::Generation(format!(
            "no valid expression of length {}..={} after {MAX_ATTEMPTS} attempts",
            self.min_len, self.max_len
        )))
    }
}

/// Evaluate a full chain; `None` if it does not parse or overflows.
fn evaluate(chain: &[Element]) -> Option<i128> {
    let mut parser = Parser { chain, pos: 0 };
    let value = parser.expression()?;
    (parser.pos == chain.len()).then_some(value)
}

struct Parser<'a> {
    chain: &'a [Element],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Element> {
        self.chain.get(self.pos).copied()
    }

    fn expression(&mut self) -> Option<i128> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some(Element::Op(Op::Add)) => {
                    self.pos += 1;
                    left = left.checked_add(self.term()?)?;
                }
                Some(Element::Op(Op::Sub)) => {
                    self.pos += 1;
                    left = left.checked_sub(self.term()?)?;
                }
                _ => return Some(left),
            }
        }
    }

    fn term(&mut self) -> Option<i128> {
        let mut left = self.primary()?;
        while let Some(Element::Op(Op::Mul)) = self.peek() {
            self.pos += 1;
            left = left.checked_mul(self.primary()?)?;
        }
        Some(left)
    }

    fn primary(&mut self) -> Option<i128> {
        match self.peek()? {
            Element::Number(n) => {
                self.pos += 1;
                Some(i128::from(n))
            }
            Element::Open => {
                self.pos += 1;
                let value = self.expression()?;
                if self.peek()? != Element::Close {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            _ => None,
        }
    }
}

fn render(chain: &[Element]) -> String {
    let mut out = String::with_capacity(chain.len() * 4);
    for element in chain {
        match element {
            Element::Number(n) => {
                let _ = write!(out, "{n}");
            }
            Element::Op(Op::Add) => out.push('+'),
            Element::Op(Op::Sub) => out.push('-'),
            Element::Op(Op::Mul) => out.push('*'),
            Element::Open => out.push('('),
            Element::Close => out.push(')'),
        }
    }
    out
}

struct EquationTask {
    expression: String,
    value: i128,
    text: Option<Bytes>,
    line: Vec<u8>,
}

impl EquationTask {
    fn new(expression: String, value: i128) -> Self {
        Self {
            expression,
            value,
            text: None,
            line: Vec::with_capacity(MAX_ANSWER_LEN),
        }
    }

    fn judge(&self) -> AnswerState {
        let line = self.line.strip_suffix(b"\r").unwrap_or(&self.line[..]);
        let parsed = std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse::<i128>().ok());

        match parsed {
            Some(v) if v == self.value => AnswerState::Right,
            _ => AnswerState::Wrong,
        }
    }
}

impl Task for EquationTask {
    fn question(&mut self) -> Result<Question, TaskError> {
        let expression = &self.expression;
        let text = self
            .text
            .get_or_insert_with(|| Bytes::from(format!("Solve: {expression}")));
        Ok(Question::new(text.clone()))
    }

    fn check(&mut self, answer: &mut dyn Read) -> AnswerState {
        // One byte at a time: whatever follows the newline belongs to the
        // next task
        let mut byte = [0u8; 1];
        loop {
            match answer.read(&mut byte) {
                Ok(0) => return AnswerState::More,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return self.judge();
                    }
                    if self.line.len() == MAX_ANSWER_LEN {
                        return AnswerState::Wrong;
                    }
                    self.line.push(byte[0]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return AnswerState::More,
                Err(_) => return AnswerState::Wrong,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn solve(text: &[u8]) -> i128 {
        let expr = std::str::from_utf8(text).unwrap().strip_prefix("Solve: ").unwrap();
        let chain = parse_text(expr);
        evaluate(&chain).unwrap()
    }

    fn parse_text(expr: &str) -> Vec<Element> {
        let mut chain = Vec::new();
        let mut digits = String::new();
        for c in expr.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if !digits.is_empty() {
                chain.push(Element::Number(digits.parse().unwrap()));
                digits.clear();
            }
            chain.push(match c {
                '+' => Element::Op(Op::Add),
                '-' => Element::Op(Op::Sub),
                '*' => Element::Op(Op::Mul),
                '(' => Element::Open,
                ')' => Element::Close,
                _ => panic!("unexpected {c}"),
            });
        }
        if !digits.is_empty() {
            chain.push(Element::Number(digits.parse().unwrap()));
        }
        chain
    }

    #[test]
    fn test_evaluate_precedence() {
        assert_eq!(evaluate(&parse_text("2+3*4")), Some(14));
        assert_eq!(evaluate(&parse_text("(2+3)*4")), Some(20));
        assert_eq!(evaluate(&parse_text("2-3-4")), Some(-5));
        assert_eq!(evaluate(&parse_text("7")), Some(7));
    }

    #[test]
    fn test_evaluate_rejects_malformed() {
        assert_eq!(evaluate(&parse_text("(2+3")), None);
        assert_eq!(evaluate(&parse_text("2+3)")), None);
        assert_eq!(evaluate(&parse_text("2+")), None);
        assert_eq!(evaluate(&parse_text("()")), None);
        assert_eq!(evaluate(&[Element::Number(1), Element::Number(2)]), None);
        assert_eq!(evaluate(&[]), None);
    }

    #[test]
    fn test_evaluate_overflow_is_rejected() {
        let big = Element::Number(u64::MAX);
        let mul = Element::Op(Op::Mul);
        let chain = [big, mul, big, mul, big];
        assert_eq!(evaluate(&chain), None);
    }

    #[test]
    fn test_render() {
        let chain = parse_text("(12+3)*45-6");
        assert_eq!(render(&chain), "(12+3)*45-6");
    }

    #[test]
    fn test_chain_len_is_odd_and_bounded() {
        let mut generator = EquationGenerator::new(2, 8, 10, true).with_seed(5);
        for _ in 0..200 {
            let len = generator.chain_len().unwrap();
            assert_eq!(len % 2, 1);
            assert!((2..=8).contains(&len));
        }

        // No odd length fits
        let mut generator = EquationGenerator::new(4, 4, 10, true);
        assert_eq!(generator.chain_len(), None);
    }

    #[test]
    fn test_generated_question_is_solvable() {
        let mut generator = EquationGenerator::new(1, 15, 1000, true).with_seed(42);
        for _ in 0..50 {
            let mut task = generator.generate().unwrap();
            let question = task.question().unwrap();
            let value = solve(question.text());

            let reply = format!("{value}\n");
            assert_eq!(task.check(&mut reply.as_bytes()), AnswerState::Right);
        }
    }

    #[test]
    fn test_without_braces() {
        let mut generator = EquationGenerator::new(9, 9, 100, false).with_seed(9);
        let mut task = generator.generate().unwrap();
        let question = task.question().unwrap();

        assert!(!question.text().contains(&b'('));
        assert_eq!(question.text().iter().filter(|b| b"+-*".contains(*b)).count(), 4);
    }

    #[test]
    fn test_impossible_length_fails() {
        let mut generator = EquationGenerator::new(4, 4, 10, true);
        assert!(matches!(generator.generate(), Err(TaskError::Generation(_))));
    }

    #[test]
    fn test_answer_across_checks() {
        let mut task = EquationTask::new("2+2".to_string(), 4);

        assert_eq!(task.check(&mut &b""[..]), AnswerState::More);
        assert_eq!(task.check(&mut &b" "[..]), AnswerState::More);
        assert_eq!(task.check(&mut &b"4\r"[..]), AnswerState::More);
        assert_eq!(task.check(&mut &b"\n"[..]), AnswerState::Right);
    }

    #[test]
    fn test_answer_stops_at_newline() {
        let mut task = EquationTask::new("1-3".to_string(), -2);
        let mut input = &b"-2\nleftover"[..];

        assert_eq!(task.check(&mut input), AnswerState::Right);
        assert_eq!(input, b"leftover");
    }

    #[test]
    fn test_wrong_answers() {
        let mut task = EquationTask::new("2+2".to_string(), 4);
        assert_eq!(task.check(&mut &b"5\n"[..]), AnswerState::Wrong);

        let mut task = EquationTask::new("2+2".to_string(), 4);
        assert_eq!(task.check(&mut &b"four\n"[..]), AnswerState::Wrong);

        let mut task = EquationTask::new("2+2".to_string(), 4);
        let long = vec![b'0'; MAX_ANSWER_LEN + 1];
        assert_eq!(task.check(&mut &long[..]), AnswerState::Wrong);
    }

    #[test]
    fn test_question_is_cached() {
        let mut task = EquationTask::new("1+1".to_string(), 2);
        let first = task.question().unwrap();
        let second = task.question().unwrap();

        assert_eq!(first.text().as_ref(), b"Solve: 1+1");
        assert_eq!(first.text().as_ptr(), second.text().as_ptr());
    }

    proptest! {
        #[test]
        fn prop_candidates_respect_length(seed in any::<u64>(), min in 1usize..20, extra in 0usize..20) {
            let max = min + extra;
            let mut generator = EquationGenerator::new(min, max, 50, true).with_seed(seed);
            if let Some(chain) = generator.candidate() {
                prop_assert!(chain.len() % 2 == 1);
                prop_assert!(chain.len() >= min && chain.len() <= max);
                if let Some(value) = evaluate(&chain) {
                    let rendered = render(&chain);
                    prop_assert_eq!(evaluate(&parse_text(&rendered)), Some(value));
                }
            }
        }
    }
}
