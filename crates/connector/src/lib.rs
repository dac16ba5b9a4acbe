pub mod manager;
pub mod webhook;

pub use manager::{
    AvailableRepo, ConnectManyReport, ConnectedRepository, ConnectionManager, FailedConnect,
};
pub use webhook::WebhookOutcome;
