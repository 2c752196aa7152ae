pub mod admin;
pub mod ai;
pub mod carriers;
pub mod clients;
pub mod dashboard;
pub mod documents;
pub mod integrations;
pub mod policies;
pub mod reports;
pub mod settings;
