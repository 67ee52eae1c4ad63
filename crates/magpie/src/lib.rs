pub mod agent;
pub mod errors;
pub mod models;
pub mod preprocess;
pub mod providers;
pub mod router;
pub mod sampling;
pub mod transport;
