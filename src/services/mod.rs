pub mod ai;
pub mod booking;
pub mod classifier;
pub mod info;
pub mod pipeline;
pub mod router;
pub mod sessions;
pub mod tools;
