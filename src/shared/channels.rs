use crate::config::BusConfig;
use crate::shared::structs::ElevatorId;

/**
 * Naming scheme for every queue, channel and key on the bus.
 *
 * With the default prefix `elevator` this yields:
 * - `elevator:requests:stream`   request queue (configurable as a whole)
 * - `elevator:commands:{id}`     per-elevator command channel
 * - `elevator:status:{id}`       per-elevator status channel
 * - `elevator:state:{id}`        per-elevator state record
 */
#[derive(Debug, Clone, PartialEq)]
pub struct BusNames {
    pub request_queue: String,
    prefix: String,
}

impl BusNames {
    pub fn new(config: &BusConfig) -> BusNames {
        BusNames {
            request_queue: config.request_queue.clone(),
            prefix: config.key_prefix.clone(),
        }
    }

    pub fn command_channel(&self, id: ElevatorId) -> String {
        format!("{}:commands:{}", self.prefix, id)
    }

    pub fn status_channel(&self, id: ElevatorId) -> String {
        format!("{}:status:{}", self.prefix, id)
    }

    pub fn state_key(&self, id: ElevatorId) -> String {
        format!("{}:state:{}", self.prefix, id)
    }
}

impl Default for BusNames {
    fn default() -> Self {
        BusNames::new(&BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::BusNames;

    #[test]
    fn test_default_names() {
        let names = BusNames::default();

        assert_eq!(names.request_queue, "elevator:requests:stream");
        assert_eq!(names.command_channel(2), "elevator:commands:2");
        assert_eq!(names.status_channel(3), "elevator:status:3");
        assert_eq!(names.state_key(1), "elevator:state:1");
    }
}
