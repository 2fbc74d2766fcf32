mod config;
mod matcher;

pub use config::{AllowListError, DomainRules};
pub use matcher::DomainClassifier;
