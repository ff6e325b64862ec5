pub mod dispatch;
pub mod notifications;
pub mod pricing;
