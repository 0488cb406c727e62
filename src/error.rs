use thiserror::Error;

use crate::action::CodecError;
use crate::channel::ChannelError;
use crate::leader::{LeaderError, RpcError};
use crate::mutator::MutatorError;
use crate::schema::{DataError, GrammarError, PathError, SchemaError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Mutator(#[from] MutatorError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Leader(#[from] LeaderError),
}
