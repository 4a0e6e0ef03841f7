pub mod events;
pub mod runs;
pub mod webhooks;
pub mod workflows;
