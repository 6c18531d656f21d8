pub mod errors;
pub mod events;
pub mod models;
pub mod plant;
pub mod store;
