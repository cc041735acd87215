pub mod analysis;
pub mod orchestrator;
pub mod routes;
pub mod scheduler;
pub mod single_flight;
pub mod store;
