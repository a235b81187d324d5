//! Small standalone utilities.

mod sort_replayer;

pub use sort_replayer::SortReplayer;
