//! Remote command surface.
//!
//! Commands and responses are plain serde types so a transport (socket,
//! pipe, HTTP) can carry them as JSON. [`Engine::handle`] dispatches one
//! command and never waits for a run: `Start` checks the preconditions and
//! then runs the job in the background.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::job::Engine;
use crate::model::{Job, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    ListJobs,
    JobStates,
    Start { name: String },
    Pause { name: String },
    Resume { name: String },
    Stop { name: String },
    Cancel { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Jobs { jobs: Vec<Job> },
    States { states: Vec<JobState> },
    Started { name: String },
    Ok,
    Error { message: String },
}

impl From<Result<(), EngineError>> for Response {
    fn from(result: Result<(), EngineError>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }
}

impl Engine {
    /// Dispatch one remote command.
    pub async fn handle(&self, command: Command) -> Response {
        tracing::debug!(?command, "remote command");
        match command {
            Command::ListJobs => Response::Jobs { jobs: self.jobs() },
            Command::JobStates => Response::States {
                states: self.states(),
            },
            Command::Start { name } => match self.start(&name).await {
                Ok(_) => Response::Started { name },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Command::Pause { name } => self.pause(&name).into(),
            Command::Resume { name } => self.resume(&name).into(),
            Command::Stop { name } => self.stop(&name).into(),
            Command::Cancel { name } => self.cancel(&name).into(),
        }
    }
}
