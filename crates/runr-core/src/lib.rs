pub mod address;
pub mod assemble;
pub mod audit;
pub mod context;
pub mod dispatch;
pub mod readme;
pub mod report;

use thiserror::Error;

use runr_domain::exit;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    MissingInput(String),
    #[error("{0}")]
    CantCreate(String),
}

impl CoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Usage(_) => exit::USAGE,
            CoreError::MissingInput(_) => exit::NO_INPUT,
            CoreError::CantCreate(_) => exit::CANT_CREATE,
            CoreError::Io(_) | CoreError::Json(_) | CoreError::Walk(_) => exit::OS_ERR,
        }
    }
}
