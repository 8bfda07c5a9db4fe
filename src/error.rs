use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while accumulating channels, persisting
/// raw results or compositing images. None of these abort the pipeline;
/// schedulers keep draining the remaining work.
#[derive(Debug, Error)]
pub enum Error {
    #[error("name conflict ({0})")]
    NameConflict(String),

    #[error("channel {0} has fewer than 2 inner iterations, the rendering would never end")]
    InsufficientIterations(String),

    #[error("no escaping seeds found within the sampling budget")]
    SeedExhaustion,

    #[error("buffer dimensions do not match")]
    DimensionMismatch,

    #[error("resolution mismatch: file is {found_width}x{found_height}, collection is {width}x{height}")]
    HeaderMismatch {
        width: usize,
        height: usize,
        found_width: usize,
        found_height: usize,
    },

    #[error("truncated or corrupt raw results record")]
    CorruptInput,

    #[error("no channel named {0}")]
    MissingChannel(String),

    #[error("desired_max has {got} entries for {want} input channels")]
    DesiredMaxArity { want: usize, got: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
