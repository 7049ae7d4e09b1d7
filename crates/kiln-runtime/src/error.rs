//! Heap and shape errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("heap exhausted while allocating {requested} bytes")]
    Exhausted { requested: usize },

    #[error("object of {requested} bytes does not fit in a {region_size}-byte region")]
    TooLarge { requested: usize, region_size: usize },

    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shape table is full")]
    TooManyShapes,

    #[error("shape already has the maximum of {max} fields")]
    TooManyFields { max: usize },

    #[error("unknown shape id {0}")]
    UnknownShape(u32),
}
