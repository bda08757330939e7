//! Configuration types for tagmsg.

use crate::error::{Error, Result};

/// Receive-side match mode.
///
/// Controls whether message matching is offloaded to the NIC, performed in
/// software, or starts offloaded with transitions to software under resource
/// pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// All matching is offloaded; resource exhaustion is fatal to offload.
    Hardware,
    /// All matching is performed in software from the start.
    Software,
    /// Matching starts offloaded and may transition to software.
    Hybrid,
}

/// Rendezvous protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdzvProto {
    /// Unrestricted get; three target events complete a receive.
    Default,
    /// Restricted get with a done-notify message; four target events.
    AltRead,
    /// Restricted write. Not implemented; refused at configuration time.
    AltWrite,
}

/// Messaging engine configuration.
///
/// Controls matching offload policy, overflow buffer sizing, rendezvous
/// crossover points and flow-control recovery behavior.
#[derive(Debug, Clone)]
pub struct MsgConfig {
    /// Receive match mode.
    /// Default: Hybrid
    pub rx_match_mode: MatchMode,
    /// Enable preemptive HW-to-SW transition on LE pool usage (LINK events).
    /// Default: false
    pub hybrid_preemptive: bool,
    /// Enable the periodic LE usage check on receive appends.
    /// Default: false
    pub hybrid_recv_preemptive: bool,
    /// Force a transition when posted receives exceed `posted_recv_hint`.
    /// Default: false
    pub hybrid_posted_recv_preemptive: bool,
    /// Force a transition when outstanding unexpected headers exceed
    /// `req_size_hint`.
    /// Default: false
    pub hybrid_unexpected_msg_preemptive: bool,
    /// Posted-receive count hint for preemptive transitions.
    /// Default: 1024
    pub posted_recv_hint: usize,
    /// Unexpected-header count hint for preemptive transitions.
    /// Default: 1024
    pub req_size_hint: usize,
    /// Overflow buffer size in bytes.
    /// Default: 2 MiB
    pub oflow_buf_size: usize,
    /// Minimum overflow buffers posted to the NIC.
    /// Default: 3
    pub oflow_buf_min_posted: usize,
    /// Maximum free overflow buffers kept cached. 0 means unbounded.
    /// Default: 3
    pub oflow_buf_max_cached: usize,
    /// Request-list (software managed) buffer size in bytes.
    /// Default: 2 MiB
    pub req_buf_size: usize,
    /// Eager/rendezvous crossover: payloads larger than this use rendezvous.
    /// Default: 16384
    pub rdzv_threshold: usize,
    /// Bytes of rendezvous payload carried with the initial put.
    /// Default: 2048
    pub rdzv_eager_size: usize,
    /// Minimum payload pulled by a rendezvous get.
    /// Default: 2048
    pub rdzv_get_min: usize,
    /// Rendezvous protocol selector.
    /// Default: Default
    pub rdzv_proto: RdzvProto,
    /// Delay between done-notify / control-message retries, in microseconds.
    /// Default: 1000
    pub fc_retry_usec_delay: u64,
    /// Force DMA commands for non-inject eager payloads.
    /// Default: false
    pub disable_non_inject_msg_idc: bool,
    /// Start with receive matching offloaded to the NIC.
    /// Default: true
    pub msg_offload: bool,
    /// Maximum inject payload size; also the IDC crossover.
    /// Default: 204
    pub inject_size: usize,
    /// Provider tag mask. Tags and ignore masks must fit inside it.
    /// Default: 40 low bits
    pub tag_mask: u64,
    /// Maximum message size.
    /// Default: 4 GiB - 1
    pub max_msg_size: usize,
    /// Minimum free bytes for a multi-receive buffer to stay linked.
    /// Default: 64
    pub min_multi_recv: usize,
    /// Maximum concurrent software-issued rendezvous gets (TX credits).
    /// Default: 16
    pub max_rx_tx_credits: usize,
    /// TX queue depth; outstanding sends beyond this are refused.
    /// Default: 256
    pub tx_size: usize,
    /// Drop counter starts (and resets) at -1 instead of 0. Set for older
    /// device generations where one state-change event arrives twice.
    /// Default: false
    pub legacy_drop_count: bool,
    /// Receives appended between LE-usage checks in hybrid mode.
    /// Default: 64
    pub hybrid_recv_check_interval: u32,
    /// Cache-line alignment mask applied to software rendezvous gets.
    /// Default: 63
    pub rget_align_mask: u64,
    /// Report source addresses on receive completions.
    /// Default: false
    pub source: bool,
    /// Report unresolvable source addresses as errors with the physical
    /// address attached. Only meaningful with `source`.
    /// Default: false
    pub source_err: bool,
}

impl Default for MsgConfig {
    fn default() -> Self {
        Self {
            rx_match_mode: MatchMode::Hybrid,
            hybrid_preemptive: false,
            hybrid_recv_preemptive: false,
            hybrid_posted_recv_preemptive: false,
            hybrid_unexpected_msg_preemptive: false,
            posted_recv_hint: 1024,
            req_size_hint: 1024,
            oflow_buf_size: 2 * 1024 * 1024,
            oflow_buf_min_posted: 3,
            oflow_buf_max_cached: 3,
            req_buf_size: 2 * 1024 * 1024,
            rdzv_threshold: 16384,
            rdzv_eager_size: 2048,
            rdzv_get_min: 2048,
            rdzv_proto: RdzvProto::Default,
            fc_retry_usec_delay: 1000,
            disable_non_inject_msg_idc: false,
            msg_offload: true,
            inject_size: 204,
            tag_mask: crate::match_bits::TAG_MASK,
            max_msg_size: (4usize << 30) - 1,
            min_multi_recv: 64,
            max_rx_tx_credits: 16,
            tx_size: 256,
            legacy_drop_count: false,
            hybrid_recv_check_interval: 64,
            rget_align_mask: 63,
            source: false,
            source_err: false,
        }
    }
}

impl MsgConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive match mode.
    pub fn with_rx_match_mode(mut self, mode: MatchMode) -> Self {
        self.rx_match_mode = mode;
        // Software mode never offloads; hardware mode always does.
        self.msg_offload = mode != MatchMode::Software;
        self
    }

    /// Set the overflow buffer size.
    pub fn with_oflow_buf_size(mut self, size: usize) -> Self {
        self.oflow_buf_size = size;
        self
    }

    /// Set the minimum posted overflow buffer count.
    pub fn with_oflow_buf_min_posted(mut self, count: usize) -> Self {
        self.oflow_buf_min_posted = count;
        self
    }

    /// Set the maximum cached overflow buffer count.
    pub fn with_oflow_buf_max_cached(mut self, count: usize) -> Self {
        self.oflow_buf_max_cached = count;
        self
    }

    /// Set the rendezvous crossover threshold.
    pub fn with_rdzv_threshold(mut self, threshold: usize) -> Self {
        self.rdzv_threshold = threshold;
        self
    }

    /// Set the rendezvous eager size.
    pub fn with_rdzv_eager_size(mut self, size: usize) -> Self {
        self.rdzv_eager_size = size;
        self
    }

    /// Set the rendezvous protocol.
    pub fn with_rdzv_proto(mut self, proto: RdzvProto) -> Self {
        self.rdzv_proto = proto;
        self
    }

    /// Set the inject size.
    pub fn with_inject_size(mut self, size: usize) -> Self {
        self.inject_size = size;
        self
    }

    /// Set the flow-control retry delay in microseconds.
    pub fn with_fc_retry_usec_delay(mut self, usecs: u64) -> Self {
        self.fc_retry_usec_delay = usecs;
        self
    }

    /// Set the minimum multi-receive remainder.
    pub fn with_min_multi_recv(mut self, bytes: usize) -> Self {
        self.min_multi_recv = bytes;
        self
    }

    /// Enable or disable legacy drop-count initialization.
    pub fn with_legacy_drop_count(mut self, legacy: bool) -> Self {
        self.legacy_drop_count = legacy;
        self
    }

    /// Enable the hybrid preemptive transition checks.
    pub fn with_hybrid_preemptive(mut self, enable: bool) -> Self {
        self.hybrid_preemptive = enable;
        self.hybrid_recv_preemptive = enable;
        self
    }

    /// Enable source-address reporting.
    pub fn with_source(mut self, source: bool, source_err: bool) -> Self {
        self.source = source;
        self.source_err = source_err;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rdzv_proto == RdzvProto::AltWrite {
            return Err(Error::InvalidConfig(
                "alternate-write rendezvous protocol is not implemented".into(),
            ));
        }
        if self.rdzv_eager_size > self.rdzv_threshold {
            return Err(Error::InvalidConfig(format!(
                "rdzv_eager_size {} exceeds rdzv_threshold {}",
                self.rdzv_eager_size, self.rdzv_threshold
            )));
        }
        if self.oflow_buf_size < self.rdzv_eager_size {
            return Err(Error::InvalidConfig(format!(
                "oflow_buf_size {} below rdzv_eager_size {}",
                self.oflow_buf_size, self.rdzv_eager_size
            )));
        }
        if self.oflow_buf_min_posted == 0 {
            return Err(Error::InvalidConfig(
                "at least one overflow buffer must be posted".into(),
            ));
        }
        if self.tag_mask & !crate::match_bits::TAG_MASK != 0 {
            return Err(Error::InvalidConfig(
                "tag_mask exceeds the wire tag field".into(),
            ));
        }
        if self.rx_match_mode == MatchMode::Software && self.msg_offload {
            return Err(Error::InvalidConfig(
                "software match mode cannot offload".into(),
            ));
        }
        Ok(())
    }

    /// Initial (and post-recovery) drop counter value.
    pub(crate) fn initial_drop_count(&self) -> i32 {
        if self.legacy_drop_count {
            -1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(MsgConfig::default().validate().is_ok());
    }

    #[test]
    fn test_alt_write_refused() {
        let cfg = MsgConfig::default().with_rdzv_proto(RdzvProto::AltWrite);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_eager_above_threshold_refused() {
        let cfg = MsgConfig::default()
            .with_rdzv_threshold(1024)
            .with_rdzv_eager_size(2048);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_software_mode_disables_offload() {
        let cfg = MsgConfig::default().with_rx_match_mode(MatchMode::Software);
        assert!(!cfg.msg_offload);
        assert!(cfg.validate().is_ok());
    }
}
