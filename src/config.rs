use std::time::Duration;

use anyhow::bail;

/// Ordering / reliability guarantees for one application channel.
///
/// Channel 0 always exists, is unreliable / unsequenced, and is reserved for control
///  traffic; the templates in [`HostConfig::channels`] configure channels `1..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTemplate {
    /// Retransmit until acknowledged, suppress duplicates.
    pub reliable: bool,
    /// Deliver in sequence-number order. For unreliable channels this means stale and
    ///  duplicate packets are dropped; gaps are never waited on. For reliable channels
    ///  it additionally means gap-free delivery, buffering ahead-of-order packets.
    pub sequenced: bool,
}

impl ChannelTemplate {
    /// Whether frames on this channel carry a sequence index after the channel id.
    pub fn has_sequence_header(&self) -> bool {
        self.reliable || self.sequenced
    }
}

pub struct HostConfig {
    /// UDP port to bind. 0 binds an ephemeral port (useful for tests and clients).
    pub port: u16,

    /// Capacity of the connection pool. Connecting beyond this fails.
    pub max_connections: usize,

    /// Shard size: each worker task drives this many consecutive pool slots. The
    ///  number of workers is `ceil(max_connections / connections_per_worker)`.
    pub connections_per_worker: usize,

    /// How long a handshake may stay unanswered before the connection is torn down.
    pub connect_timeout: Duration,

    /// How long an established connection tolerates inbound silence. Also bounds how
    ///  long a reliable message may stay unacknowledged.
    pub disconnect_timeout: Duration,

    /// Period between connect-request resends while connecting, and between
    ///  keep-alive probes once connected.
    pub handshake_frequency: Duration,

    /// Period between retransmissions of an unacknowledged reliable message.
    pub resend_interval: Duration,

    /// Unreliable messages that sat in the send queue longer than this are dropped
    ///  instead of sent - they are assumed stale.
    pub unreliable_drop_timeout: Duration,

    /// How long a disconnected slot is kept around before it can be reused. During
    ///  this grace period late packets from the old peer still resolve to the dead
    ///  connection instead of leaking into a new one.
    pub reclaim_grace: Duration,

    /// Upper bound on a single blocking socket receive. This caps shutdown latency;
    ///  it does not drop packets.
    pub receive_timeout: Duration,

    /// Poll period of the shard worker loops.
    pub worker_tick: Duration,

    /// How many outstanding keep-alive probes to remember for ping matching.
    pub keep_alive_history: usize,

    /// Templates for application channels, in order; the template at index `i`
    ///  configures channel id `i + 1`.
    pub channels: Vec<ChannelTemplate>,
}

impl HostConfig {
    pub fn new(port: u16) -> HostConfig {
        HostConfig {
            port,
            max_connections: 16,
            connections_per_worker: 8,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(3),
            handshake_frequency: Duration::from_millis(200),
            resend_interval: Duration::from_millis(300),
            unreliable_drop_timeout: Duration::from_millis(500),
            reclaim_grace: Duration::from_secs(2),
            receive_timeout: Duration::from_millis(50),
            worker_tick: Duration::from_millis(1),
            keep_alive_history: 50,
            channels: Vec::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.connections_per_worker == 0 {
            bail!("connections_per_worker must be at least 1");
        }
        if self.channels.len() > 255 {
            bail!("at most 255 application channels are supported (channel 0 is reserved)");
        }
        if self.keep_alive_history == 0 {
            bail!("keep_alive_history must be at least 1");
        }

        Ok(())
    }

    /// The template for a given wire channel id, or `None` if the id is not configured.
    ///  Channel 0 is implicit and always unreliable / unsequenced.
    pub fn channel_template(&self, channel_id: u8) -> Option<ChannelTemplate> {
        if channel_id == 0 {
            return Some(ChannelTemplate { reliable: false, sequenced: false });
        }
        self.channels.get(channel_id as usize - 1).copied()
    }

    /// Number of configured channels including the implicit channel 0.
    pub fn num_channels(&self) -> usize {
        self.channels.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn defaults_validate() {
        assert!(HostConfig::new(0).validate().is_ok());
    }

    #[rstest]
    #[case::no_connections(0, 8, 1, 50)]
    #[case::no_shard(16, 0, 1, 50)]
    #[case::too_many_channels(16, 8, 256, 50)]
    #[case::no_keep_alive_history(16, 8, 1, 0)]
    fn invalid_configs_are_rejected(
        #[case] max_connections: usize,
        #[case] connections_per_worker: usize,
        #[case] num_channels: usize,
        #[case] keep_alive_history: usize,
    ) {
        let mut config = HostConfig::new(0);
        config.max_connections = max_connections;
        config.connections_per_worker = connections_per_worker;
        config.keep_alive_history = keep_alive_history;
        config.channels =
            vec![ChannelTemplate { reliable: false, sequenced: false }; num_channels];

        assert!(config.validate().is_err());
    }

    #[test]
    fn channel_zero_is_implicit_and_unsequenced() {
        let config = HostConfig::new(0);
        let template = config.channel_template(0).unwrap();
        assert!(!template.reliable);
        assert!(!template.sequenced);
        assert!(!template.has_sequence_header());
    }

    #[test]
    fn templates_map_to_channel_ids_starting_at_one() {
        let mut config = HostConfig::new(0);
        config.channels = vec![
            ChannelTemplate { reliable: false, sequenced: true },
            ChannelTemplate { reliable: true, sequenced: true },
        ];

        assert!(config.channel_template(1).unwrap().sequenced);
        assert!(config.channel_template(2).unwrap().reliable);
        assert!(config.channel_template(3).is_none());
        assert_eq!(config.num_channels(), 3);
    }

    #[rstest]
    #[case::unreliable_unsequenced(false, false, false)]
    #[case::unreliable_sequenced(false, true, true)]
    #[case::reliable_unsequenced(true, false, true)]
    #[case::reliable_sequenced(true, true, true)]
    fn sequence_header_presence(
        #[case] reliable: bool,
        #[case] sequenced: bool,
        #[case] expected: bool,
    ) {
        let template = ChannelTemplate { reliable, sequenced };
        assert_eq!(template.has_sequence_header(), expected);
    }
}
