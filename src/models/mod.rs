pub mod driver;
pub mod event;
pub mod settlement;
pub mod trip;
