//! Background executors: the donation verification job, the pending-donation
//! scan that feeds it, the persistence seam, and outcome webhooks.

pub mod scan;
pub mod store;
pub mod verify;
pub mod webhook;
