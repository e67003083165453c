pub mod plan;
pub mod token;
pub mod usage;
pub mod user;
