/***************************************/
/*        3rd party libraries          */
/***************************************/
use serde::Deserialize;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/***************************************/
/*            Type aliases             */
/***************************************/
pub type ElevatorId = u32;
pub type Floor = i32;

/***************************************/
/*       Public data structures        */
/***************************************/
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "moving")]
    Moving,
    #[serde(rename = "door_open")]
    DoorOpen,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Idle,
}

impl Direction {
    /// Sign of `to - from` expressed as a direction.
    pub fn toward(from: Floor, to: Floor) -> Direction {
        match (to - from).signum() {
            1 => Direction::Up,
            -1 => Direction::Down,
            _ => Direction::Idle,
        }
    }

    pub fn step(&self) -> Floor {
        match *self {
            Direction::Up => 1,
            Direction::Down => -1,
            Direction::Idle => 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DoorState {
    Open,
    Closed,
}

/// Hall call direction carried by external requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Up,
    Down,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Internal,
    External,
}

/**
 * Passenger demand as produced by the ingress.
 *
 * External requests are hall calls (`floor` + `direction`), internal requests are
 * destination buttons pressed inside a car (`elevator_id` + `destination_floor`).
 * A request is never mutated after creation.
 */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub floor: Floor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CallDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevator_id: Option<ElevatorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_floor: Option<Floor>,
    pub timestamp: u64,
}

#[cfg(test)]
impl Request {
    pub fn external(id: &str, floor: Floor, direction: CallDirection) -> Request {
        Request {
            id: id.to_string(),
            kind: RequestType::External,
            floor,
            direction: Some(direction),
            elevator_id: None,
            destination_floor: None,
            timestamp: epoch_millis(),
        }
    }

    pub fn internal(id: &str, elevator_id: ElevatorId, floor: Floor, destination_floor: Floor) -> Request {
        Request {
            id: id.to_string(),
            kind: RequestType::Internal,
            floor,
            direction: None,
            elevator_id: Some(elevator_id),
            destination_floor: Some(destination_floor),
            timestamp: epoch_millis(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Command {
    pub elevator_id: ElevatorId,
    pub destination_floor: Floor,
    pub issued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub elevator_id: ElevatorId,
    pub current_floor: Floor,
    pub direction: Direction,
    pub door_state: DoorState,
    pub status: Behaviour,
    pub queue: Vec<Floor>,
    pub timestamp: u64,
}

/**
 * Snapshot of one elevator as persisted in the state store.
 *
 * Only the owning controller writes this record. The scheduler reads it, possibly stale.
 */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ElevatorState {
    pub id: ElevatorId,
    pub current_floor: Floor,
    pub direction: Direction,
    pub door_state: DoorState,
    #[serde(rename = "queue")]
    pub destination_queue: Vec<Floor>,
    pub status: Behaviour,
    pub updated_at: u64,
}

impl ElevatorState {
    pub fn new(id: ElevatorId, floor: Floor) -> ElevatorState {
        ElevatorState {
            id,
            current_floor: floor,
            direction: Direction::Idle,
            door_state: DoorState::Closed,
            destination_queue: Vec::new(),
            status: Behaviour::Idle,
            updated_at: epoch_millis(),
        }
    }

    pub fn status_event(&self) -> StatusEvent {
        StatusEvent {
            elevator_id: self.id,
            current_floor: self.current_floor,
            direction: self.direction,
            door_state: self.door_state,
            status: self.status,
            queue: self.destination_queue.clone(),
            timestamp: self.updated_at,
        }
    }
}

/***************************************/
/*             Public API              */
/***************************************/
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
