pub mod classifications;
pub mod classify;
pub mod keywords;
pub mod upload;
pub mod webhooks;
