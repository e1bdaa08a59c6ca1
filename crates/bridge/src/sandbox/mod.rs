pub mod dispatcher;
pub mod invocation;

pub use invocation::{Invocation, RunPythonOutcome, RunPythonRequest, Status};
