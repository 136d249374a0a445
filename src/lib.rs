//! plotline: a multi-reactor question/answer challenge server
//!
//! Clients connect to a port, get a sequence of questions ("tasks") from
//! the plot served there, and have to answer each one, often against a
//! deadline, to get to the next. A wrong or late answer ends the session.
//!
//! Features:
//! - One acceptor thread plus a pool of mio worker reactors
//! - Per-client reply deadlines on timerfd
//! - Plots built from stages of equation, echo and banner generators
//! - Plots can be added and removed on a running server
//! - Configuration via CLI arguments or TOML file

#[cfg(not(target_os = "linux"))]
compile_error!("plotline needs Linux (epoll and timerfd)");

pub mod config;
pub mod generators;
pub mod plot;
pub mod runtime;
pub mod server;

pub use config::{Config, ConfigError};
pub use plot::{AnswerState, Plot, PlotConstructor, PlotTask, Question, Task, TaskError};
pub use server::{Server, ServerError};
