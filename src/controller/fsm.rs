/***************************************/
/*        3rd party libraries          */
/***************************************/
use thiserror::Error;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::config::BuildingConfig;
use crate::shared::structs::epoch_millis;
use crate::shared::{Behaviour, Direction, DoorState, ElevatorState, Floor};

/**
 * Movement state machine of a single elevator.
 *
 * States are `Idle`, `Moving` and `DoorOpen`. Stops are visited in strict FIFO order
 * of arrival; a floor already queued is never queued twice. Every method returns the
 * `Transition` it caused so the caller can publish and persist.
 *
 * The machine owns no timers. The controller calls `tick` on every simulated time step
 * and `close_door` once the door-hold has elapsed.
 */
#[derive(Debug, Clone)]
pub struct ElevatorFsm {
    state: ElevatorState,
    min_floor: Floor,
    max_floor: Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing observable changed.
    Unchanged,
    /// Destination appended while busy.
    Queued(Floor),
    /// Left `Idle` towards the given destination.
    Started(Floor),
    /// Crossed into the given floor, still travelling.
    Moved(Floor),
    /// Arrived (or was already) at the given floor, door is now open.
    DoorOpened(Floor),
    /// Door closed, heading to the next queued floor.
    Departed(Floor),
    /// Door closed with nothing left to do.
    Parked,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        *self != Transition::Unchanged
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandRejected {
    #[error("floor {floor} is outside [{min}, {max}]")]
    OutOfRange { floor: Floor, min: Floor, max: Floor },
}

impl ElevatorFsm {
    pub fn new(state: ElevatorState, building: &BuildingConfig) -> ElevatorFsm {
        ElevatorFsm {
            state,
            min_floor: building.min_floor,
            max_floor: building.max_floor,
        }
    }

    /**
     * Rebuilds a machine from a previously persisted snapshot.
     *
     * Returns `None` if the snapshot places the car outside the building. Out of range
     * or repeated queue entries are dropped and the behaviour is derived from the
     * door and the queue, so a half-written record cannot wedge the machine.
     */
    pub fn resume(mut state: ElevatorState, building: &BuildingConfig) -> Option<ElevatorFsm> {
        if !building.contains(state.current_floor) {
            return None;
        }

        let mut queue: Vec<Floor> = Vec::with_capacity(state.destination_queue.len());
        for floor in state.destination_queue.drain(..) {
            if building.contains(floor) && !queue.contains(&floor) {
                queue.push(floor);
            }
        }
        state.destination_queue = queue;

        if state.door_state == DoorState::Open {
            state.status = Behaviour::DoorOpen;
            state.direction = Direction::Idle;
        } else if let Some(&head) = state.destination_queue.first() {
            state.status = Behaviour::Moving;
            state.direction = Direction::toward(state.current_floor, head);
        } else {
            state.status = Behaviour::Idle;
            state.direction = Direction::Idle;
        }

        Some(ElevatorFsm::new(state, building))
    }

    pub fn state(&self) -> &ElevatorState {
        &self.state
    }

    pub fn handle_command(&mut self, destination: Floor) -> Result<Transition, CommandRejected> {
        if destination < self.min_floor || destination > self.max_floor {
            return Err(CommandRejected::OutOfRange {
                floor: destination,
                min: self.min_floor,
                max: self.max_floor,
            });
        }

        let transition = match self.state.status {
            Behaviour::Idle if destination == self.state.current_floor => {
                self.open_door();
                Transition::DoorOpened(destination)
            }
            Behaviour::Idle => {
                self.enqueue(destination);
                self.state.status = Behaviour::Moving;
                self.state.direction = Direction::toward(self.state.current_floor, destination);
                Transition::Started(destination)
            }
            // Door already open here, the floor is being served
            Behaviour::DoorOpen if destination == self.state.current_floor => Transition::Unchanged,
            Behaviour::Moving | Behaviour::DoorOpen => {
                if self.enqueue(destination) {
                    Transition::Queued(destination)
                } else {
                    Transition::Unchanged
                }
            }
        };

        if transition.is_change() {
            self.touch();
        }
        Ok(transition)
    }

    /// Advances one simulated time step. Only a moving car reacts.
    pub fn tick(&mut self) -> Transition {
        if self.state.status != Behaviour::Moving {
            return Transition::Unchanged;
        }

        let head = match self.state.destination_queue.first() {
            Some(&head) => head,
            None => {
                self.park();
                self.touch();
                return Transition::Parked;
            }
        };

        let step = Direction::toward(self.state.current_floor, head).step();
        self.state.current_floor += step;
        self.state.direction = Direction::toward(self.state.current_floor, head);
        self.touch();

        if self.state.current_floor == head {
            self.state.destination_queue.remove(0);
            self.open_door();
            Transition::DoorOpened(head)
        } else {
            Transition::Moved(self.state.current_floor)
        }
    }

    /// Ends the door-hold. Only meaningful while the door is open.
    pub fn close_door(&mut self) -> Transition {
        if self.state.status != Behaviour::DoorOpen {
            return Transition::Unchanged;
        }

        self.state.door_state = DoorState::Closed;
        let transition = match self.state.destination_queue.first() {
            Some(&head) => {
                self.state.status = Behaviour::Moving;
                self.state.direction = Direction::toward(self.state.current_floor, head);
                Transition::Departed(head)
            }
            None => {
                self.park();
                Transition::Parked
            }
        };

        self.touch();
        transition
    }

    fn enqueue(&mut self, floor: Floor) -> bool {
        if self.state.destination_queue.contains(&floor) {
            return false;
        }
        self.state.destination_queue.push(floor);
        true
    }

    fn open_door(&mut self) {
        self.state.status = Behaviour::DoorOpen;
        self.state.door_state = DoorState::Open;
        self.state.direction = Direction::Idle;
    }

    fn park(&mut self) {
        self.state.status = Behaviour::Idle;
        self.state.direction = Direction::Idle;
    }

    fn touch(&mut self) {
        self.state.updated_at = epoch_millis();
    }
}

/***************************************/
/*           Test functions            */
/***************************************/
#[cfg(test)]
impl ElevatorFsm {
    pub fn test_at(floor: Floor, min_floor: Floor, max_floor: Floor) -> ElevatorFsm {
        ElevatorFsm::new(
            ElevatorState::new(1, floor),
            &BuildingConfig { min_floor, max_floor },
        )
    }

    /// Ticks and closes doors until the car is idle, returning every transition.
    pub fn test_run_until_idle(&mut self, max_steps: usize) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for _ in 0..max_steps {
            let transition = match self.state.status {
                Behaviour::Idle => return transitions,
                Behaviour::Moving => self.tick(),
                Behaviour::DoorOpen => self.close_door(),
            };
            transitions.push(transition);
        }
        transitions
    }
}
