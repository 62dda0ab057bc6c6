mod admin;
mod health;
mod metrics;
mod resources;
mod usage;

pub use admin::{reset_usage_handler, set_subscription_handler};
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use resources::{
    create_report_handler, create_survey_handler, list_surveys_handler, submit_response_handler,
};
pub use usage::usage_handler;
