//! Outbound dispatch: delayed scheduling, SMTP delivery, and the
//! per-conversation send mutex that keeps replies at-most-once.

pub mod mailer;
pub mod scheduler;
pub mod sender;

pub use mailer::{Mailer, OutboundEmail, SmtpMailer};
pub use scheduler::{schedule_name, DispatchPayload, DispatchScheduler, ScheduleClient};
pub use sender::{Deliverer, DeliveryOutcome, InProcessScheduler};
