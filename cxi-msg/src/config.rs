// SPDX-License-Identifier: BSD-3-Clause

//! Recognized configuration options (spec §6.3).

/// Offload policy for a receive context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMatchMode {
    /// Matching happens entirely on the NIC's priority/overflow lists.
    Hardware,
    /// Matching happens entirely in the software receive queue.
    Software,
    /// Hardware matching, with preemptive software fallback under the
    /// conditions of §4.7.1.
    Hybrid,
}

/// Rendezvous protocol selector (match-bits `rdzv_proto`, spec §6.1/§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdzvProto {
    /// The target pulls payload from the initiator with a `Get` and, for the
    /// restricted variant, exchanges a done-notify/ack pair afterward.
    Restricted { done_notify: bool },
    /// The initiator pushes the remainder with a `Put`. Spec §9 Open
    /// Question (iii): the source material that this crate is modeled on
    /// warns this path is "not implemented". Selecting it is refused by
    /// [`Config::validate`] rather than silently downgraded.
    Write,
}

/// Which ASIC generation's drop-counter convention to use (spec §4.7.1,
/// §9 Open Question (ii)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCountInit {
    /// Newer generation: counter starts at zero, one event per drop.
    StartsAtZero,
    /// Older generation: counter starts at -1 because the triggering event
    /// arrives twice.
    StartsAtNegativeOne,
}

impl DropCountInit {
    pub fn initial_value(self) -> i64 {
        match self {
            Self::StartsAtZero => 0,
            Self::StartsAtNegativeOne => -1,
        }
    }
}

/// Individually togglable hybrid preemption checks (spec §4.7.1).
#[derive(Debug, Clone, Copy)]
pub struct HybridPreemptive {
    pub enabled: bool,
    pub on_link_le_usage: bool,
    pub on_posted_recv_count: bool,
    pub on_unexpected_msg_count: bool,
}

impl Default for HybridPreemptive {
    fn default() -> Self {
        Self {
            enabled: false,
            on_link_le_usage: true,
            on_posted_recv_count: true,
            on_unexpected_msg_count: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rx_match_mode: RxMatchMode,
    pub hybrid_preemptive: HybridPreemptive,

    pub oflow_buf_size: u64,
    pub oflow_buf_min_posted: u32,
    pub oflow_buf_max_cached: u32,

    pub req_buf_size: u64,

    pub rdzv_threshold: u64,
    pub rdzv_eager_size: u64,
    pub rdzv_get_min: u64,
    pub rdzv_proto: RdzvProto,

    pub fc_retry_usec_delay: u64,
    pub drop_count_init: DropCountInit,

    pub disable_non_inject_msg_idc: bool,
    pub msg_offload: bool,

    pub inject_size: u64,
    pub tag_mask: u64,
    pub max_msg_sz: u64,

    /// Not one of the named options in spec §6.3: bounds how many unmatched
    /// records the deferred-event table (C2) may hold before `match_put_event`
    /// reports an allocation failure and the caller surfaces `try-later`
    /// (spec §4.2's "on allocation failure return (false, nil)"). Sized
    /// generously; under normal operation the table drains as fast as it
    /// fills.
    pub deferred_table_capacity: usize,

    /// Maximum number of concurrent software-issued rendezvous pulls
    /// (spec §4.3.4's "TX-credit reservation").
    pub max_concurrent_rdzv_pulls: u32,

    /// Minimum remaining multi-receive room to keep matching against a
    /// buffer (spec §4.3.4, §4.3.6, `min_multi_recv`).
    pub min_multi_recv: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The alternate-write rendezvous protocol was selected; spec §9 Open
    /// Question (iii) leaves it explicitly unimplemented.
    UnimplementedRdzvProto,
    /// `rdzv_eager_size` must not exceed `rdzv_threshold`: the eager head
    /// that rides along with the rendezvous event can never be larger than
    /// the point at which a message becomes a rendezvous message.
    EagerSizeExceedsThreshold,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnimplementedRdzvProto => {
                write!(f, "the write rendezvous protocol is not implemented")
            }
            Self::EagerSizeExceedsThreshold => {
                write!(f, "rdzv_eager_size must not exceed rdzv_threshold")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.rdzv_proto, RdzvProto::Write) {
            return Err(ConfigError::UnimplementedRdzvProto);
        }
        if self.rdzv_eager_size > self.rdzv_threshold {
            return Err(ConfigError::EagerSizeExceedsThreshold);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rx_match_mode: RxMatchMode::Hardware,
            hybrid_preemptive: HybridPreemptive::default(),

            oflow_buf_size: 2 * 1024 * 1024,
            oflow_buf_min_posted: 3,
            oflow_buf_max_cached: 8,

            req_buf_size: 2 * 1024 * 1024,

            rdzv_threshold: 2048,
            rdzv_eager_size: 2048,
            rdzv_get_min: 2048,
            rdzv_proto: RdzvProto::Restricted { done_notify: true },

            fc_retry_usec_delay: 1,
            drop_count_init: DropCountInit::StartsAtZero,

            disable_non_inject_msg_idc: false,
            msg_offload: true,

            inject_size: 192,
            tag_mask: (1 << 48) - 1,
            max_msg_sz: 1 << 30,

            deferred_table_capacity: 16 * 1024,
            max_concurrent_rdzv_pulls: 1024,
            min_multi_recv: 64,
        }
    }
}

/// Builder for overriding a handful of [`Config`] fields without repeating the
/// rest — the same "defaults, then override what you need" shape the
/// teacher's bin targets use when turning CLI args into a server address.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    cfg: ConfigOverlay,
}

#[derive(Debug, Clone, Default)]
struct ConfigOverlay {
    rx_match_mode: Option<RxMatchMode>,
    rdzv_threshold: Option<u64>,
    rdzv_proto: Option<RdzvProto>,
    drop_count_init: Option<DropCountInit>,
    inject_size: Option<u64>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rx_match_mode(mut self, mode: RxMatchMode) -> Self {
        self.cfg.rx_match_mode = Some(mode);
        self
    }

    pub fn rdzv_threshold(mut self, bytes: u64) -> Self {
        self.cfg.rdzv_threshold = Some(bytes);
        self
    }

    pub fn rdzv_proto(mut self, proto: RdzvProto) -> Self {
        self.cfg.rdzv_proto = Some(proto);
        self
    }

    pub fn drop_count_init(mut self, init: DropCountInit) -> Self {
        self.cfg.drop_count_init = Some(init);
        self
    }

    pub fn inject_size(mut self, bytes: u64) -> Self {
        self.cfg.inject_size = Some(bytes);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Some(v) = self.cfg.rx_match_mode {
            config.rx_match_mode = v;
        }
        if let Some(v) = self.cfg.rdzv_threshold {
            config.rdzv_threshold = v;
        }
        if let Some(v) = self.cfg.rdzv_proto {
            config.rdzv_proto = v;
        }
        if let Some(v) = self.cfg.drop_count_init {
            config.drop_count_init = v;
        }
        if let Some(v) = self.cfg.inject_size {
            config.inject_size = v;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn write_protocol_is_refused() {
        let err = ConfigBuilder::new()
            .rdzv_proto(RdzvProto::Write)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::UnimplementedRdzvProto);
    }

    #[test]
    fn eager_size_cannot_exceed_threshold() {
        let mut config = Config::default();
        config.rdzv_eager_size = config.rdzv_threshold + 1;
        assert_eq!(config.validate(), Err(ConfigError::EagerSizeExceedsThreshold));
    }
}
