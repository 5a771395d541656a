#[macro_use]
pub mod macros;
pub mod channels;
pub mod error;
pub mod structs;

pub use channels::BusNames;
pub use error::BusError;
pub use structs::Behaviour;
pub use structs::Command;
pub use structs::Direction;
pub use structs::DoorState;
pub use structs::ElevatorId;
pub use structs::ElevatorState;
pub use structs::Floor;
pub use structs::Request;
pub use structs::RequestType;
