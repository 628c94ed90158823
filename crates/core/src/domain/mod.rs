pub mod booking;
pub mod message;
