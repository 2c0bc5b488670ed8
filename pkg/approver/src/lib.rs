pub mod client;
pub mod controller;
pub mod queue;
pub mod recognizer;
pub mod sync;
