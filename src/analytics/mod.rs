pub mod captable;

pub use captable::CapTable;
