use anyhow::bail;
use crate::frame::DATA_FRAME_MIN_LENGTH;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the scratch buffer that outbound frames are encoded into. Every frame an
    ///  engine writes must fit, including a reassembled message of a full slot.
    pub write_buffer_capacity: usize,

    /// Size of a single pooled slot. This limits the size of a reassembled message, and the
    ///  amount of data a network stream can hold back when its channel does not accept writes.
    pub slot_capacity: usize,

    /// Number of slots shared by all streams of an engine. A stream that needs a slot while all
    ///  of them are in use is rejected.
    pub slot_count: usize,

    /// Per-frame overhead the proxy adds to the padding it forwards, on top of the padding its
    ///  downstream peer asked for. This makes sure that forwarded credit never overstates what
    ///  the peer actually granted, even if frames are re-framed on the way.
    pub proxy_padding: u32,

    /// Window granted to the reply direction of fanned-out secondary streams. Their replies are
    ///  consumed locally, so this window is acknowledged as soon as data arrives.
    pub fan_out_reply_window: u32,

    /// Maximum number of bytes a network stream reads from its channel per readiness event
    pub network_read_capacity: usize,
}

impl EngineConfig {
    pub fn default_config() -> EngineConfig {
        EngineConfig {
            write_buffer_capacity: 64 * 1024,
            slot_capacity: 16 * 1024,
            slot_count: 1024,
            proxy_padding: 0,
            fan_out_reply_window: 8 * 1024,
            network_read_capacity: 8 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slot_count == 0 {
            bail!("slot pool must have at least one slot");
        }
        if self.slot_capacity == 0 {
            bail!("slot capacity must not be zero");
        }
        if self.slot_capacity > u32::MAX as usize {
            bail!("slot capacity {} exceeds the maximum window size", self.slot_capacity);
        }
        if self.write_buffer_capacity < self.slot_capacity + DATA_FRAME_MIN_LENGTH {
            bail!("write buffer of {} bytes cannot hold a Data frame for a full slot of {} bytes", self.write_buffer_capacity, self.slot_capacity);
        }
        if self.network_read_capacity == 0 {
            bail!("network read capacity must not be zero");
        }
        if self.network_read_capacity + DATA_FRAME_MIN_LENGTH > self.write_buffer_capacity {
            bail!("write buffer of {} bytes cannot hold a Data frame for a network read of {} bytes", self.write_buffer_capacity, self.network_read_capacity);
        }
        Ok(())
    }
}

/// How the proxy forwards initial Data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    /// every Data frame is forwarded as it arrives
    #[default]
    Stream,
    /// fragments are reassembled, and only complete messages are forwarded
    Message,
}

/// A condition attached to a route, interpreted by the binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCondition {
    pub name: String,
    pub value: String,
}
impl RouteCondition {
    pub fn new(name: &str, value: &str) -> RouteCondition {
        RouteCondition {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Binding ids to connect to. The first one is the primary target whose reply is forwarded,
    ///  any others receive a copy of the initial stream.
    pub exits: Vec<u64>,
    /// bits that must all be present in a stream's authorization for the route to apply
    pub guard: Option<u64>,
    pub when: Vec<RouteCondition>,
}
impl RouteConfig {
    pub fn to_exit(exit: u64) -> RouteConfig {
        RouteConfig {
            exits: vec![exit],
            guard: None,
            when: Vec::new(),
        }
    }

    pub fn condition(&self, name: &str) -> Option<&str> {
        self.when.iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    fn is_authorized(&self, authorization: u64) -> bool {
        match self.guard {
            Some(guard) => authorization & guard == guard,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingConfig {
    pub id: u64,
    pub mode: ForwardMode,
    pub routes: Vec<RouteConfig>,
}
impl BindingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for route in &self.routes {
            if route.exits.is_empty() {
                bail!("binding {}: route without exit", self.id);
            }
            if route.exits.contains(&self.id) {
                bail!("binding {}: route to itself", self.id);
            }
        }
        Ok(())
    }

    /// the first route that the authorization passes and that satisfies `matches`
    pub fn resolve(&self, authorization: u64, matches: impl Fn(&RouteConfig) -> bool) -> Option<&RouteConfig> {
        self.routes.iter()
            .filter(|r| r.is_authorized(authorization))
            .find(|r| matches(r))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default_config().validate().is_ok());
    }

    #[rstest]
    #[case::no_slots(|c: &mut EngineConfig| c.slot_count = 0)]
    #[case::empty_slots(|c: &mut EngineConfig| c.slot_capacity = 0)]
    #[case::slot_too_big_for_write_buffer(|c: &mut EngineConfig| c.slot_capacity = c.write_buffer_capacity)]
    #[case::no_network_reads(|c: &mut EngineConfig| c.network_read_capacity = 0)]
    #[case::network_read_too_big(|c: &mut EngineConfig| c.network_read_capacity = c.write_buffer_capacity)]
    fn test_invalid_config(#[case] modify: fn(&mut EngineConfig)) {
        let mut config = EngineConfig::default_config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    fn binding() -> BindingConfig {
        BindingConfig {
            id: 1,
            mode: ForwardMode::Stream,
            routes: vec![
                RouteConfig { exits: vec![10], guard: Some(0b110), when: vec![] },
                RouteConfig { exits: vec![20], guard: None, when: vec![RouteCondition::new("port", "80")] },
                RouteConfig { exits: vec![30, 31], guard: None, when: vec![] },
            ],
        }
    }

    #[rstest]
    #[case::guarded(0b111, true, Some(10))]
    #[case::guard_missing_bit(0b010, true, Some(20))]
    #[case::condition_rejected(0, false, Some(30))]
    fn test_resolve(#[case] authorization: u64, #[case] port_matches: bool, #[case] expected_exit: Option<u64>) {
        let binding = binding();
        let route = binding.resolve(authorization, |r| match r.condition("port") {
            Some(_) => port_matches,
            None => true,
        });
        assert_eq!(route.map(|r| r.exits[0]), expected_exit);
    }

    #[test]
    fn test_resolve_no_match() {
        assert!(binding().resolve(0, |_| false).is_none());
    }

    #[rstest]
    #[case::valid(vec![RouteConfig::to_exit(2)], true)]
    #[case::no_routes(vec![], true)]
    #[case::no_exit(vec![RouteConfig { exits: vec![], guard: None, when: vec![] }], false)]
    #[case::to_itself(vec![RouteConfig::to_exit(2), RouteConfig::to_exit(1)], false)]
    fn test_validate_binding(#[case] routes: Vec<RouteConfig>, #[case] expected_ok: bool) {
        let binding = BindingConfig { id: 1, mode: ForwardMode::Message, routes };
        assert_eq!(binding.validate().is_ok(), expected_ok);
    }
}
