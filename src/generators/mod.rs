//! Task generators used by the configurable plots.
//!
//! A generator is long-lived: one instance lives inside a plot stage and
//! produces a fresh task every time the stage advances.
//!
//! ## Generators
//!
//! - [`EquationGenerator`]: arithmetic expressions to evaluate
//! - [`EchoGenerator`]: random tokens to send back verbatim
//! - [`BannerGenerator`]: fixed text, always accepted

use crate::plot::{Task, TaskError};

mod banner;
mod echo;
mod equation;

pub use banner::BannerGenerator;
pub use echo::EchoGenerator;
pub use equation::EquationGenerator;

/// Source of tasks for a plot stage.
pub trait Generator: Send {
    /// Produce the next task.
    fn generate(&mut self) -> Result<Box<dyn Task>, TaskError>;
}
