/***************************************/
/*        3rd party libraries          */
/***************************************/
use crossbeam_channel as cbc;
use log::{debug, error, info, warn};
use std::time::Duration;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::bus::{Delivery, MessageBus, RetryPolicy, StateStore};
use crate::config::{BuildingConfig, Config};
use crate::shared::structs::epoch_millis;
use crate::shared::{
    BusError, BusNames, Command, ElevatorId, ElevatorState, Floor, Request, RequestType,
};

/***************************************/
/*               Enums                 */
/***************************************/
enum Event {
    RequestReceived(Delivery),
    NoEvent,
    Terminate,
}

/// What became of one delivered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Command published to the elevator and the request acknowledged.
    Assigned(ElevatorId),
    /// Malformed request, acknowledged without a command.
    Dropped,
    /// Left unacknowledged, the bus hands it out again after the idle window.
    Deferred,
}

/// Elevator closest to `floor`. Ties go to the lowest id.
pub fn select_nearest(states: &[ElevatorState], floor: Floor) -> Option<ElevatorId> {
    states
        .iter()
        .min_by_key(|state| ((state.current_floor - floor).unsigned_abs(), state.id))
        .map(|state| state.id)
}

/***************************************/
/*             Public API              */
/***************************************/

/**
 * Assigns queued requests to elevators.
 *
 * The scheduler is a member of the request queue's consumer group. For every
 * delivered request it reads the stored state of each configured elevator, picks a
 * target, publishes a `Command` on that elevator's command channel and only then
 * acknowledges the request. Anything that prevents the command from being sent
 * leaves the request pending, so it is delivered again (at-least-once).
 *
 * # Fields
 * - `bus`:             Bus and state store handle, owned by this scheduler alone.
 * - `group`:           Consumer group shared by all scheduler instances.
 * - `consumer`:        This instance's name within the group.
 * - `elevator_ids`:    Elevators eligible for assignment.
 * - `retry`:           Backoff for every bus and store call.
 * - `terminate_rx`:    Checked between consume calls.
 */
pub struct Scheduler<B: MessageBus + StateStore> {
    bus: B,
    names: BusNames,
    group: String,
    consumer: String,
    block_timeout: Duration,
    elevator_ids: Vec<ElevatorId>,
    building: BuildingConfig,
    retry: RetryPolicy,

    // Channels
    terminate_rx: cbc::Receiver<()>,
}

impl<B: MessageBus + StateStore> Scheduler<B> {
    pub fn new(config: &Config, bus: B, terminate_rx: cbc::Receiver<()>) -> Scheduler<B> {
        Scheduler {
            bus,
            names: BusNames::new(&config.bus),
            group: config.scheduler.consumer_group.clone(),
            consumer: config.scheduler.consumer_name(),
            block_timeout: config.scheduler.block_timeout(),
            elevator_ids: config.elevator.ids.clone(),
            building: config.building.clone(),
            retry: RetryPolicy::new(&config.retry),
            terminate_rx,
        }
    }

    /// Idempotent, an existing group counts as success.
    pub fn ensure_group(&mut self) -> Result<(), BusError> {
        let bus = &mut self.bus;
        let queue = &self.names.request_queue;
        let group = &self.group;
        self.retry
            .run("ensure_group", || bus.ensure_group(queue, group))
    }

    pub fn run(mut self) -> Result<(), BusError> {
        self.ensure_group()?;
        info!(
            "scheduler_started: consumer={}, group={}, queue={}",
            self.consumer, self.group, self.names.request_queue
        );

        // Main loop
        loop {
            match self.wait_for_event()? {
                Event::RequestReceived(delivery) => {
                    let outcome = self.handle_request(delivery)?;
                    debug!("request_outcome: {:?}", outcome);
                }
                Event::NoEvent => {}
                Event::Terminate => {
                    info!("scheduler_stopped: consumer={}", self.consumer);
                    return Ok(());
                }
            }
        }
    }

    fn wait_for_event(&mut self) -> Result<Event, BusError> {
        // A dropped sender stops the loop as well
        match self.terminate_rx.try_recv() {
            Ok(()) | Err(cbc::TryRecvError::Disconnected) => return Ok(Event::Terminate),
            Err(cbc::TryRecvError::Empty) => {}
        }

        let bus = &mut self.bus;
        let queue = &self.names.request_queue;
        let group = &self.group;
        let consumer = &self.consumer;
        let block_timeout = self.block_timeout;
        let delivery = self.retry.run("consume", || {
            bus.consume(queue, group, consumer, block_timeout)
        })?;

        Ok(match delivery {
            Some(delivery) => Event::RequestReceived(delivery),
            None => Event::NoEvent,
        })
    }

    fn handle_request(&mut self, delivery: Delivery) -> Result<Outcome, BusError> {
        let request: Request = match serde_json::from_str(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "malformed_request: message_id={}, error={}",
                    delivery.message_id, e
                );
                return self.drop_request(&delivery);
            }
        };

        info!(
            "received_request: request_id={}, type={:?}, floor={}",
            request.id, request.kind, request.floor
        );

        let (elevator_id, destination) = match request.kind {
            RequestType::Internal => match self.route_internal(&request) {
                Ok(target) => {
                    info!(
                        "assigned_internal_request: request_id={}, elevator_id={}, destination={}",
                        request.id, target.0, target.1
                    );
                    target
                }
                Err(reason) => {
                    warn!("malformed_request: request_id={}, {}", request.id, reason);
                    return self.drop_request(&delivery);
                }
            },
            RequestType::External => {
                if !self.building.contains(request.floor) {
                    warn!(
                        "malformed_request: request_id={}, floor {} outside [{}, {}]",
                        request.id,
                        request.floor,
                        self.building.min_floor,
                        self.building.max_floor
                    );
                    return self.drop_request(&delivery);
                }

                let states = match self.read_states() {
                    Ok(states) => states,
                    Err(e) => {
                        warn!(
                            "state_store_unavailable: request_id={}, leaving unacked, error={}",
                            request.id, e
                        );
                        return Ok(Outcome::Deferred);
                    }
                };

                match select_nearest(&states, request.floor) {
                    Some(elevator_id) => {
                        info!(
                            "assigned_external_request: request_id={}, elevator_id={}, floor={}",
                            request.id, elevator_id, request.floor
                        );
                        (elevator_id, request.floor)
                    }
                    None => {
                        warn!("no_suitable_elevator: request_id={}", request.id);
                        return Ok(Outcome::Deferred);
                    }
                }
            }
        };

        self.send_command(&request, elevator_id, destination)?;
        self.ack(&delivery)?;
        Ok(Outcome::Assigned(elevator_id))
    }

    fn route_internal(&self, request: &Request) -> Result<(ElevatorId, Floor), String> {
        let elevator_id = request
            .elevator_id
            .ok_or_else(|| "internal request without elevator_id".to_string())?;
        let destination = request
            .destination_floor
            .ok_or_else(|| "internal request without destination_floor".to_string())?;

        if !self.elevator_ids.contains(&elevator_id) {
            return Err(format!("unknown elevator {}", elevator_id));
        }
        if !self.building.contains(destination) {
            return Err(format!(
                "destination {} outside [{}, {}]",
                destination, self.building.min_floor, self.building.max_floor
            ));
        }
        Ok((elevator_id, destination))
    }

    /// Stored state of every configured elevator that has one.
    fn read_states(&mut self) -> Result<Vec<ElevatorState>, BusError> {
        let bus = &mut self.bus;
        let ids = &self.elevator_ids;
        self.retry.run("read_states", || bus.list_states(ids))
    }

    fn send_command(
        &mut self,
        request: &Request,
        elevator_id: ElevatorId,
        destination: Floor,
    ) -> Result<(), BusError> {
        let command = Command {
            elevator_id,
            destination_floor: destination,
            issued_at: epoch_millis(),
            request_id: Some(request.id.clone()),
        };
        let payload =
            serde_json::to_string(&command).map_err(|e| BusError::Malformed(e.to_string()))?;

        let bus = &mut self.bus;
        let channel = self.names.command_channel(elevator_id);
        self.retry
            .run("publish_command", || bus.publish(&channel, &payload))
    }

    fn drop_request(&mut self, delivery: &Delivery) -> Result<Outcome, BusError> {
        self.ack(delivery)?;
        Ok(Outcome::Dropped)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let bus = &mut self.bus;
        let queue = &self.names.request_queue;
        let group = &self.group;
        self.retry
            .run("ack", || bus.ack(queue, group, &delivery.message_id))
            .map_err(|e| {
                error!(
                    "ack_failed: message_id={}, error={}",
                    delivery.message_id, e
                );
                e
            })
    }
}

/***************************************/
/*           Test functions            */
/***************************************/
#[cfg(test)]
impl<B: MessageBus + StateStore> Scheduler<B> {
    /// One consume and, if something arrived, its handling.
    pub fn test_process_next(&mut self) -> Result<Option<Outcome>, BusError> {
        match self.wait_for_event()? {
            Event::RequestReceived(delivery) => self.handle_request(delivery).map(Some),
            Event::NoEvent | Event::Terminate => Ok(None),
        }
    }
}
