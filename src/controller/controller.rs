/***************************************/
/*        3rd party libraries          */
/***************************************/
use crossbeam_channel as cbc;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

/***************************************/
/*           Local modules             */
/***************************************/
use crate::bus::{MessageBus, RetryPolicy, StateStore, Subscription};
use crate::config::Config;
use crate::controller::fsm::{ElevatorFsm, Transition};
use crate::shared::{BusError, BusNames, Command, DoorState, ElevatorId, ElevatorState};

enum Event {
    CommandReceived(String),
    Tick,
    DoorTimeout,
    Terminate,
    SubscriptionClosed,
}

/**
 * Drives one elevator.
 *
 * The `ElevatorController` owns the elevator's state machine and is the only writer of
 * its state record. It listens on the elevator's command channel, advances the car on
 * a fixed tick, holds the door open for the configured time, and after every change
 * publishes a status event and writes the full snapshot to the state store.
 *
 * # Fields
 * - `id`:              Elevator this controller owns.
 * - `bus`:             Bus and state store handle, owned by this controller alone.
 * - `command_sub`:     Subscription to `elevator:commands:{id}`.
 * - `ticker`:          Periodic simulation tick.
 * - `door_timer`:      One-shot door-hold timer, `never()` while the door is closed.
 * - `terminate_rx`:    Stops the main loop.
 * - `fsm`:             Movement state machine.
 * - `state_dirty`:     Last state write failed and must be repeated on the next tick.
 */
pub struct ElevatorController<B: MessageBus + StateStore> {
    id: ElevatorId,
    names: BusNames,
    bus: B,

    // Channels
    command_sub: Subscription,
    ticker: cbc::Receiver<Instant>,
    door_timer: cbc::Receiver<Instant>,
    terminate_rx: cbc::Receiver<()>,

    // Private fields
    fsm: ElevatorFsm,
    door_hold: Duration,
    state_dirty: bool,
}

impl<B: MessageBus + StateStore> ElevatorController<B> {
    pub fn new(
        config: &Config,
        id: ElevatorId,
        mut bus: B,
        terminate_rx: cbc::Receiver<()>,
    ) -> Result<ElevatorController<B>, BusError> {
        let names = BusNames::new(&config.bus);
        let command_sub = bus.subscribe(&names.command_channel(id))?;

        // Pick up where a previous instance left off
        let fresh = || {
            ElevatorFsm::new(
                ElevatorState::new(id, config.elevator.initial_floor),
                &config.building,
            )
        };
        let stored = RetryPolicy::new(&config.retry).run("get_state", || bus.get_state(id));
        let fsm = match stored {
            Ok(Some(previous)) => match ElevatorFsm::resume(previous, &config.building) {
                Some(fsm) => {
                    info!(
                        "restored_state: elevator_id={}, floor={}, queue={:?}",
                        id,
                        fsm.state().current_floor,
                        fsm.state().destination_queue
                    );
                    fsm
                }
                None => {
                    warn!("stored_state_out_of_range: elevator_id={}, starting fresh", id);
                    fresh()
                }
            },
            Ok(None) => fresh(),
            Err(BusError::Malformed(e)) => {
                warn!("stored_state_unreadable: elevator_id={}, starting fresh, error={}", id, e);
                fresh()
            }
            // An unreachable record is never replaced by a fresh one
            Err(e) => {
                error!("elevator_state_not_loaded: elevator_id={}, error={}", id, e);
                return Err(e);
            }
        };

        let door_timer = if fsm.state().door_state == DoorState::Open {
            cbc::after(config.elevator.door_hold())
        } else {
            cbc::never()
        };

        Ok(ElevatorController {
            id,
            names,
            bus,
            command_sub,
            ticker: cbc::tick(config.elevator.tick_interval()),
            door_timer,
            terminate_rx,
            fsm,
            door_hold: config.elevator.door_hold(),
            state_dirty: false,
        })
    }

    pub fn run(mut self) -> Result<(), BusError> {
        info!(
            "controller_started: elevator_id={}, floor={}",
            self.id,
            self.fsm.state().current_floor
        );
        self.publish_and_persist();

        // Main loop
        loop {
            match self.wait_for_event() {
                Event::Terminate => {
                    if self.state_dirty {
                        self.persist();
                    }
                    info!("controller_stopped: elevator_id={}", self.id);
                    return Ok(());
                }
                Event::SubscriptionClosed => {
                    error!("command_subscription_closed: elevator_id={}", self.id);
                    return Err(BusError::ConnectionLost {
                        operation: "subscribe",
                        attempts: 1,
                        source: Box::new(BusError::Transient(format!(
                            "command channel of elevator {} closed",
                            self.id
                        ))),
                    });
                }
                event => self.handle_event(event),
            }
        }
    }

    fn wait_for_event(&self) -> Event {
        cbc::select! {
            recv(self.command_sub.receiver()) -> msg => match msg {
                Ok(raw) => Event::CommandReceived(raw),
                Err(_) => Event::SubscriptionClosed,
            },
            recv(self.door_timer) -> _ => Event::DoorTimeout,
            recv(self.ticker) -> _ => Event::Tick,
            recv(self.terminate_rx) -> _ => Event::Terminate,
        }
    }

    fn handle_event(&mut self, event: Event) {
        let transition = match event {
            Event::CommandReceived(raw) => self.handle_command(&raw),
            Event::Tick => {
                let transition = self.fsm.tick();
                if !transition.is_change() && self.state_dirty {
                    // Nothing moved, but the last write still has to land
                    self.persist();
                }
                transition
            }
            Event::DoorTimeout => {
                self.door_timer = cbc::never();
                self.fsm.close_door()
            }
            Event::Terminate | Event::SubscriptionClosed => Transition::Unchanged,
        };

        self.apply(transition);
    }

    fn handle_command(&mut self, raw: &str) -> Transition {
        let command: Command = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!("invalid_command: elevator_id={}, error={}, raw={}", self.id, e, raw);
                return Transition::Unchanged;
            }
        };

        if command.elevator_id != self.id {
            warn!(
                "misrouted_command: elevator_id={}, addressed_to={}",
                self.id, command.elevator_id
            );
            return Transition::Unchanged;
        }

        info!(
            "received_command: elevator_id={}, floor={}, request_id={}",
            self.id,
            command.destination_floor,
            command.request_id.as_deref().unwrap_or("-")
        );

        match self.fsm.handle_command(command.destination_floor) {
            Ok(Transition::Unchanged) => {
                debug!(
                    "duplicate_destination: elevator_id={}, floor={}",
                    self.id, command.destination_floor
                );
                Transition::Unchanged
            }
            Ok(transition) => transition,
            Err(e) => {
                warn!("invalid_floor: elevator_id={}, {}", self.id, e);
                Transition::Unchanged
            }
        }
    }

    fn apply(&mut self, transition: Transition) {
        if !transition.is_change() {
            return;
        }

        match transition {
            Transition::DoorOpened(floor) => {
                info!("arrived_at_floor: elevator_id={}, floor={}", self.id, floor);
                self.door_timer = cbc::after(self.door_hold);
            }
            Transition::Departed(floor) | Transition::Started(floor) => {
                info!(
                    "moving_to_floor: elevator_id={}, current_floor={}, next_floor={}",
                    self.id,
                    self.fsm.state().current_floor,
                    floor
                );
            }
            Transition::Parked => {
                info!("idle: elevator_id={}, floor={}", self.id, self.fsm.state().current_floor);
            }
            _ => {}
        }

        self.publish_and_persist();
    }

    // Store first, so a listener reacting to the event reads at least this snapshot
    fn publish_and_persist(&mut self) {
        self.persist();
        self.publish_status();
    }

    // Fire-and-forget, the state store stays authoritative
    fn publish_status(&mut self) {
        let event = self.fsm.state().status_event();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("status_encode_failed: elevator_id={}, error={}", self.id, e);
                return;
            }
        };

        if let Err(e) = self.bus.publish(&self.names.status_channel(self.id), &payload) {
            debug!("status_publish_failed: elevator_id={}, error={}", self.id, e);
        }
    }

    // Single attempt, a failure is repeated on the next tick
    fn persist(&mut self) {
        match self.bus.put_state(self.id, self.fsm.state()) {
            Ok(()) => self.state_dirty = false,
            Err(e) => {
                if !self.state_dirty {
                    warn!("state_write_failed: elevator_id={}, error={}", self.id, e);
                }
                self.state_dirty = true;
            }
        }
    }
}

/***************************************/
/*           Test functions            */
/***************************************/
#[cfg(test)]
impl<B: MessageBus + StateStore> ElevatorController<B> {
    pub fn test_get_state(&self) -> &ElevatorState {
        self.fsm.state()
    }

    pub fn test_is_dirty(&self) -> bool {
        self.state_dirty
    }

    pub fn test_handle_raw_command(&mut self, raw: &str) {
        self.handle_event(Event::CommandReceived(raw.to_string()));
    }

    pub fn test_tick(&mut self) {
        self.handle_event(Event::Tick);
    }

    pub fn test_door_timeout(&mut self) {
        self.handle_event(Event::DoorTimeout);
    }
}
