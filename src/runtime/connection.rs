//! Per-client session state.
//!
//! A `Client` owns its socket, its plot and the question currently being
//! sent. It knows how to move itself through the session (start a task,
//! push the question out, judge an answer) but not how it is registered
//! with the multiplexer; that is the worker's job.

use crate::plot::{AnswerState, Plot, PlotTask, Question, TaskError};
use crate::runtime::buffer::ByteStream;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Trailer sent after a question without deadline.
const NO_TIMEOUT_TRAILER: &[u8] = b"\nAnswer (no timeout): ";

/// Session state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, no task handed out yet.
    Connecting,
    /// A question is queued and being written out.
    SendingQuestion,
    /// The question is out; waiting for the answer.
    AwaitingAnswer,
    /// Terminal.
    Disconnected,
}

/// Failures that end a client's session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The question could not be queued for sending.
    #[error("send queue rejected {0} bytes")]
    Queue(usize),
}

/// A connected client.
pub struct Client {
    pub(crate) stream: TcpStream,
    pub(crate) token: Token,
    pub(crate) peer: Option<SocketAddr>,
    /// Timer slab keys armed for this client.
    pub(crate) timers: Vec<usize>,
    state: ClientState,
    plot: Box<dyn Plot>,
    task: Option<PlotTask>,
    question: Option<Question>,
    send: ByteStream,
}

impl Client {
    pub fn new(stream: TcpStream, token: Token, plot: Box<dyn Plot>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            token,
            peer,
            timers: Vec::new(),
            state: ClientState::Connecting,
            plot,
            task: None,
            question: None,
            send: ByteStream::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// Deadline of the current task, if it has one.
    pub fn timeout(&self) -> Option<Duration> {
        self.task.as_ref().and_then(PlotTask::timeout)
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> usize {
        self.send.len()
    }

    /// Replace the current task with the plot's next one and queue its
    /// question.
    ///
    /// Returns `Ok(false)` once the plot has no tasks left.
    pub fn start_task(&mut self) -> Result<bool, ClientError> {
        self.send.flush();
        self.question = None;
        self.task = None;

        let Some(mut task) = self.plot.next_task()? else {
            return Ok(false);
        };
        let question = task.question()?;

        let text = question.text().clone();
        let expected = text.len();
        if self.send.write_borrow(text) != expected {
            return Err(ClientError::Queue(expected));
        }

        let queued = match task.timeout_ms() {
            0 => self.send.write_borrow(Bytes::from_static(NO_TIMEOUT_TRAILER)),
            ms => {
                let trailer = format!("\nAnswer (timeout {ms} msec): ");
                let n = self.send.write_slice(trailer.as_bytes());
                if n != trailer.len() {
                    return Err(ClientError::Queue(trailer.len()));
                }
                n
            }
        };
        if queued == 0 {
            return Err(ClientError::Queue(NO_TIMEOUT_TRAILER.len()));
        }

        self.task = Some(task);
        self.question = Some(question);
        self.state = ClientState::SendingQuestion;
        Ok(true)
    }

    /// Write as much of the queued question as the socket takes.
    ///
    /// Returns `Ok(true)` once everything is out; the question is dropped
    /// and the client starts waiting for the answer.
    pub fn flush_question(&mut self) -> io::Result<bool> {
        assert_eq!(self.state, ClientState::SendingQuestion);

        let stream = &mut self.stream;
        while !self.send.is_empty() {
            let mut failure = None;
            let len = self.send.len();
            let n = self.send.read(
                |chunk| match stream.write(chunk) {
                    Ok(n) => n,
                    Err(e) => {
                        failure = Some(e);
                        0
                    }
                },
                len,
            );

            match failure {
                Some(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Some(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(e) => return Err(e),
                None if n == 0 => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                None => {}
            }
        }

        self.question = None;
        self.state = ClientState::AwaitingAnswer;
        Ok(true)
    }

    /// Let the current task judge whatever the client has sent so far.
    ///
    /// # Panics
    ///
    /// Panics if there is no current task.
    pub fn check_answer(&mut self) -> AnswerState {
        let task = self.task.as_mut().expect("answer checked without a task");
        task.check(&mut AnswerReader {
            stream: &mut self.stream,
        })
    }

    /// Drop everything the session holds.
    pub fn close(&mut self) {
        self.send.flush();
        self.question = None;
        self.task = None;
        self.state = ClientState::Disconnected;
    }
}

/// Non-blocking view of the socket handed to answer checks.
///
/// "Nothing more right now" reads as end of input.
struct AnswerReader<'a> {
    stream: &'a mut TcpStream,
}

impl Read for AnswerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::testing::scripted;
    use std::net::TcpListener;

    fn pair() -> (std::net::TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    fn client_with(script: Vec<(&'static str, &'static [u8], u64)>) -> (std::net::TcpStream, Client) {
        let (peer, stream) = pair();
        let plot = scripted(script)().unwrap();
        (peer, Client::new(stream, Token(0), plot))
    }

    fn read_exact(peer: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_client_state_transitions() {
        let (mut peer, mut client) = client_with(vec![("2+2", b"4", 0)]);
        assert_eq!(client.state(), ClientState::Connecting);
        assert!(client.peer.is_some());

        assert!(client.start_task().unwrap());
        assert_eq!(client.state(), ClientState::SendingQuestion);

        assert!(client.flush_question().unwrap());
        assert_eq!(client.state(), ClientState::AwaitingAnswer);
        assert_eq!(client.pending(), 0);

        let expected = b"2+2\nAnswer (no timeout): ";
        assert_eq!(read_exact(&mut peer, expected.len()), expected);

        client.close();
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.has_task());
    }

    #[test]
    fn test_timeout_trailer() {
        let (mut peer, mut client) = client_with(vec![("q", b"a", 1500)]);

        assert!(client.start_task().unwrap());
        assert_eq!(client.timeout(), Some(Duration::from_millis(1500)));
        assert!(client.flush_question().unwrap());

        let expected = b"q\nAnswer (timeout 1500 msec): ";
        assert_eq!(read_exact(&mut peer, expected.len()), expected);
    }

    #[test]
    fn test_exhausted_plot() {
        let (_peer, mut client) = client_with(vec![]);
        assert!(!client.start_task().unwrap());
        assert!(!client.has_task());
    }

    #[test]
    fn test_check_answer_without_input_is_more() {
        let (mut peer, mut client) = client_with(vec![("q", b"ok", 0)]);
        client.start_task().unwrap();
        client.flush_question().unwrap();

        assert_eq!(client.check_answer(), AnswerState::More);

        peer.write_all(b"ok").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut state = client.check_answer();
        while state == AnswerState::More && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            state = client.check_answer();
        }
        assert_eq!(state, AnswerState::Right);
    }

    #[test]
    fn test_start_task_replaces_pending_question() {
        let (_peer, mut client) = client_with(vec![("first", b"a", 0), ("second", b"b", 0)]);

        client.start_task().unwrap();
        let first = client.pending();
        client.start_task().unwrap();

        assert_eq!(client.pending(), first + 1);
    }
}
