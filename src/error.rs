/// Error types for the unlock scheduler core
///
/// Eligibility conditions are explicit variants so the HTTP layer and the
/// background sweep can tell "do not retry this user" apart from transient
/// storage failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("user {0} not found")]
    UnknownUser(i64),

    #[error("user {0} is deactivated")]
    UserInactive(i64),

    #[error("user {0} has not completed the placement quiz")]
    QuizNotCompleted(i64),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    /// True for conditions that retrying will not fix (skip, don't requeue)
    pub fn is_not_eligible(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownUser(_)
                | SchedulerError::UserInactive(_)
                | SchedulerError::QuizNotCompleted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
