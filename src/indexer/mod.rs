pub mod decoder;
pub mod pipeline;
pub mod source;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod testing;
