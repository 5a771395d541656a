pub mod controller;
pub mod fsm;

pub use controller::ElevatorController;
