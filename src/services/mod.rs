pub mod clock;
pub mod data_source;
pub mod driver;
pub mod pipeline;
pub mod profiles;
pub mod queue;
pub mod reporter;
pub mod scheduler;
pub mod store;
pub mod validation;
