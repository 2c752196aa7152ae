pub mod assistant;
pub mod documents;
pub mod integrations;
pub mod reports;
pub mod settings_store;
