pub mod conversion;
pub mod detected;
pub mod documents;
pub mod lifecycle;
pub mod recurring;
pub mod schedule;
pub mod sequence;
pub mod state;
