use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process exit status shared with the launcher that runs the server and
/// with the supervisor that runs sandbox workers. The numeric values are a
/// fixed contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    Restart = 1,
    SandboxInitError = 101,
    SandboxBindError = 102,
    SandboxNoMaster = 103,
    SandboxParamError = 104,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Restart),
            101 => Some(Self::SandboxInitError),
            102 => Some(Self::SandboxBindError),
            103 => Some(Self::SandboxNoMaster),
            104 => Some(Self::SandboxParamError),
            _ => None,
        }
    }

    /// The sandbox failure this code reports, if any.
    pub fn failure(self) -> Option<SandboxFailure> {
        match self {
            Self::SandboxInitError => Some(SandboxFailure::Init),
            Self::SandboxBindError => Some(SandboxFailure::Bind),
            Self::SandboxNoMaster => Some(SandboxFailure::NoMaster),
            Self::SandboxParamError => Some(SandboxFailure::Param),
            Self::Ok | Self::Restart => None,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Fatal sandbox failures. None of these are retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum SandboxFailure {
    #[error("sandbox initialization error")]
    Init,
    #[error("sandbox could not bind its listening port")]
    Bind,
    #[error("sandbox could not locate its master process")]
    NoMaster,
    #[error("sandbox was started with invalid parameters")]
    Param,
}

impl SandboxFailure {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Init => ExitCode::SandboxInitError,
            Self::Bind => ExitCode::SandboxBindError,
            Self::NoMaster => ExitCode::SandboxNoMaster,
            Self::Param => ExitCode::SandboxParamError,
        }
    }
}

/// Recovery decision derived from a terminated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Ok,
    RestartRequested,
    Fatal(SandboxFailure),
}

impl ExitClass {
    /// Classifies a worker termination. `None` means the worker did not exit
    /// with a status code (killed by a signal). Crashes and unknown codes are
    /// relaunched like an explicit restart request.
    pub fn from_status(code: Option<i32>) -> Self {
        match code.and_then(ExitCode::from_code) {
            Some(ExitCode::Ok) => Self::Ok,
            Some(ExitCode::Restart) | None => Self::RestartRequested,
            Some(other) => other
                .failure()
                .map(Self::Fatal)
                .unwrap_or(Self::RestartRequested),
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The contract code that stands for this decision.
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Ok => ExitCode::Ok,
            Self::RestartRequested => ExitCode::Restart,
            Self::Fatal(failure) => failure.exit_code(),
        }
    }
}
