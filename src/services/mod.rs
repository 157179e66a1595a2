pub mod bus;
pub mod dispatch;
pub mod lifecycle;
pub mod location;
pub mod settlement;
pub mod store;
pub mod verification;
