//! Engine-local refusals.

use thiserror::Error;
use uuid::Uuid;

use crate::martingale::MartingaleError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("signal {0} already has an attempt awaiting its result")]
    AttemptOutstanding(Uuid),

    #[error("unknown signal {0}")]
    UnknownSignal(Uuid),

    #[error("signal {0} has already resolved")]
    RunResolved(Uuid),

    #[error("attempt {sequence} is not the outstanding attempt of signal {signal_id}")]
    UnexpectedAttempt { signal_id: Uuid, sequence: u32 },

    #[error("martingale: {0}")]
    Martingale(#[from] MartingaleError),
}
