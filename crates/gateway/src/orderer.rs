//! Packet orderer
//!
//! Restores the sequence order of packets per `(account, instance number, host)`
//! stream. Packets with gaps wait until the gap closes or the ordering timeout
//! elapses; the timeout flushes them anyway and requests one resynchronization.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use termsync_core::SynchronizationPacket;
use tokio::time::Instant;

struct WaitingPacket {
    packet: SynchronizationPacket,
    received_at: Instant,
}

#[derive(Default)]
struct StreamState {
    /// Sequence number of the last dispatched packet
    last_sequence: Option<u64>,
    session_start_timestamp: Option<i64>,
    /// Buffered packets in arrival order
    wait_list: Vec<WaitingPacket>,
    out_of_order_reported: bool,
}

impl StreamState {
    /// Move waiting packets that continue the sequence to `out`
    fn drain_consecutive(&mut self, out: &mut Vec<SynchronizationPacket>) {
        loop {
            let Some(last) = self.last_sequence else {
                return;
            };
            let position = self.wait_list.iter().position(|waiting| {
                matches!(waiting.packet.sequence_number, Some(seq) if seq == last || seq == last + 1)
            });
            let Some(position) = position else {
                return;
            };
            let waiting = self.wait_list.remove(position);
            self.last_sequence = waiting.packet.sequence_number;
            out.push(waiting.packet);
        }
    }
}

/// Buffered packets released by an ordering timeout
#[derive(Debug)]
pub struct OrderingTimeout {
    pub account_id: String,
    pub instance_number: u32,
    pub host: String,
    /// Packets to dispatch, in arrival order
    pub packets: Vec<SynchronizationPacket>,
    /// Whether a resynchronization should be requested for the instance
    pub resynchronize: bool,
}

pub struct PacketOrderer {
    timeout: Duration,
    wait_list_size_limit: usize,
    streams: Mutex<HashMap<String, StreamState>>,
}

impl PacketOrderer {
    pub fn new(timeout: Duration, wait_list_size_limit: usize) -> Self {
        Self {
            timeout,
            wait_list_size_limit: wait_list_size_limit.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Packets that may be dispatched now, in order.
    ///
    /// Packets without a sequence number are not ordered. A session start restarts
    /// the sequence of its stream. Packets older than the current sequence are dropped.
    pub fn restore_order(&self, packet: SynchronizationPacket) -> Vec<SynchronizationPacket> {
        let Some(sequence_number) = packet.sequence_number else {
            return vec![packet];
        };

        let stream_id = packet.stream_id();
        let mut streams = self.streams.lock();
        let stream = streams.entry(stream_id).or_default();
        let mut ready = Vec::new();

        if packet.is_session_start() {
            let session_start = packet.sequence_timestamp;
            stream.last_sequence = Some(sequence_number);
            stream.session_start_timestamp = session_start;
            stream.out_of_order_reported = false;
            stream.wait_list.retain(|waiting| {
                match (waiting.packet.sequence_number, waiting.packet.sequence_timestamp) {
                    (Some(seq), _) if seq < sequence_number => false,
                    (_, Some(ts)) => session_start.is_none_or(|start| ts >= start),
                    _ => true,
                }
            });
            ready.push(packet);
            stream.drain_consecutive(&mut ready);
            return ready;
        }

        if let (Some(start), Some(ts)) = (stream.session_start_timestamp, packet.sequence_timestamp)
            && ts < start
        {
            debug!(
                "{}: dropping packet {} of a previous session",
                packet.stream_id(),
                sequence_number
            );
            return ready;
        }

        match stream.last_sequence {
            Some(last) if sequence_number == last => ready.push(packet),
            Some(last) if sequence_number == last + 1 => {
                stream.last_sequence = Some(sequence_number);
                ready.push(packet);
                stream.drain_consecutive(&mut ready);
            }
            Some(last) if sequence_number < last => {
                debug!(
                    "{}: dropping stale packet {sequence_number}, already at {last}",
                    packet.stream_id()
                );
            }
            _ => {
                stream.wait_list.push(WaitingPacket {
                    packet,
                    received_at: Instant::now(),
                });
                if stream.wait_list.len() > self.wait_list_size_limit {
                    stream.wait_list.remove(0);
                }
            }
        }
        ready
    }

    /// Streams whose oldest buffered packet waited longer than the timeout
    pub fn expired_streams(&self) -> Vec<String> {
        let now = Instant::now();
        self.streams
            .lock()
            .iter()
            .filter(|(_, stream)| {
                stream
                    .wait_list
                    .first()
                    .is_some_and(|oldest| now.duration_since(oldest.received_at) >= self.timeout)
            })
            .map(|(stream_id, _)| stream_id.clone())
            .collect()
    }

    /// Flush a stream if its oldest buffered packet is still past the timeout.
    /// `None` when the gap closed since the stream was reported expired.
    pub fn flush_expired(&self, stream_id: &str) -> Option<OrderingTimeout> {
        let now = Instant::now();
        let mut streams = self.streams.lock();
        let stream = streams.get_mut(stream_id)?;
        let oldest = stream.wait_list.first()?;
        if now.duration_since(oldest.received_at) < self.timeout {
            return None;
        }

        let account_id = oldest.packet.account_id.clone();
        let instance_number = oldest.packet.instance_number();
        let host = oldest.packet.host().to_string();
        let packets: Vec<SynchronizationPacket> =
            stream.wait_list.drain(..).map(|waiting| waiting.packet).collect();
        if let Some(highest) = packets.iter().filter_map(|p| p.sequence_number).max() {
            stream.last_sequence = Some(stream.last_sequence.map_or(highest, |last| last.max(highest)));
        }

        let resynchronize = !stream.out_of_order_reported;
        stream.out_of_order_reported = true;
        warn!(
            "{stream_id}: sequence gap not closed within {:?}, flushing {} packets",
            self.timeout,
            packets.len()
        );
        Some(OrderingTimeout {
            account_id,
            instance_number,
            host,
            packets,
            resynchronize,
        })
    }

    /// Forget the streams of an account
    pub fn clear_account(&self, account_id: &str) {
        let prefix = format!("{account_id}:");
        self.streams
            .lock()
            .retain(|stream_id, _| !stream_id.starts_with(&prefix));
    }

    pub fn waiting_count(&self, stream_id: &str) -> usize {
        self.streams
            .lock()
            .get(stream_id)
            .map_or(0, |stream| stream.wait_list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termsync_core::PacketPayload;

    fn packet(seq: u64) -> SynchronizationPacket {
        packet_at(seq, 1000 + seq as i64)
    }

    fn packet_at(seq: u64, timestamp: i64) -> SynchronizationPacket {
        SynchronizationPacket::new("accountId", PacketPayload::Disconnected)
            .with_instance(0, "ps-mpa-0")
            .with_sequence(seq, timestamp)
    }

    fn session_start(seq: u64, timestamp: i64) -> SynchronizationPacket {
        SynchronizationPacket::new(
            "accountId",
            PacketPayload::SynchronizationStarted {
                specifications_hash_index: None,
                positions_hash_index: None,
                orders_hash_index: None,
                specifications_updated: None,
                positions_updated: None,
                orders_updated: None,
            },
        )
        .with_instance(0, "ps-mpa-0")
        .with_sequence(seq, timestamp)
        .with_synchronization_id("synchronizationId")
    }

    fn sequences(packets: &[SynchronizationPacket]) -> Vec<u64> {
        packets.iter().filter_map(|p| p.sequence_number).collect()
    }

    fn flush_all(orderer: &PacketOrderer) -> Vec<OrderingTimeout> {
        orderer
            .expired_streams()
            .iter()
            .filter_map(|stream_id| orderer.flush_expired(stream_id))
            .collect()
    }

    #[test]
    fn test_unsequenced_packets_pass_through() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);
        let packet = SynchronizationPacket::new("accountId", PacketPayload::Disconnected);

        assert_eq!(orderer.restore_order(packet).len(), 1);
    }

    #[test]
    fn test_restores_order_after_gap() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);

        assert_eq!(sequences(&orderer.restore_order(session_start(1, 1001))), vec![1]);
        assert!(orderer.restore_order(packet(3)).is_empty());
        assert!(orderer.restore_order(packet(4)).is_empty());
        assert_eq!(sequences(&orderer.restore_order(packet(2))), vec![2, 3, 4]);
        assert_eq!(orderer.waiting_count("accountId:0:ps-mpa-0"), 0);
    }

    #[test]
    fn test_equal_sequence_passes_and_stale_is_dropped() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);
        orderer.restore_order(session_start(5, 1005));

        assert_eq!(sequences(&orderer.restore_order(packet(5))), vec![5]);
        assert_eq!(sequences(&orderer.restore_order(packet(6))), vec![6]);
        assert!(orderer.restore_order(packet(4)).is_empty());
        assert_eq!(orderer.waiting_count("accountId:0:ps-mpa-0"), 0);
    }

    #[test]
    fn test_packets_wait_for_session_start() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);

        assert!(orderer.restore_order(packet(2)).is_empty());
        assert_eq!(sequences(&orderer.restore_order(session_start(1, 1001))), vec![1, 2]);
    }

    #[test]
    fn test_session_start_drops_previous_session_packets() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);
        orderer.restore_order(session_start(1, 1001));
        assert!(orderer.restore_order(packet(9)).is_empty());

        let ready = orderer.restore_order(session_start(1, 5000));

        assert_eq!(sequences(&ready), vec![1]);
        assert_eq!(orderer.waiting_count("accountId:0:ps-mpa-0"), 0);
    }

    #[test]
    fn test_wait_list_is_bounded() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 2);
        orderer.restore_order(session_start(1, 1001));
        orderer.restore_order(packet(3));
        orderer.restore_order(packet(4));
        orderer.restore_order(packet(5));

        assert_eq!(orderer.waiting_count("accountId:0:ps-mpa-0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flushes_and_resynchronizes_once() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);
        orderer.restore_order(session_start(1, 1001));
        orderer.restore_order(packet(3));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(flush_all(&orderer).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let expired = flush_all(&orderer);
        assert_eq!(expired.len(), 1);
        assert_eq!(sequences(&expired[0].packets), vec![3]);
        assert!(expired[0].resynchronize);

        orderer.restore_order(packet(5));
        tokio::time::advance(Duration::from_secs(61)).await;
        let expired = flush_all(&orderer);
        assert_eq!(expired.len(), 1);
        assert!(!expired[0].resynchronize);

        orderer.restore_order(session_start(1, 9000));
        orderer.restore_order(packet_at(3, 9003));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(flush_all(&orderer)[0].resynchronize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_skips_stream_whose_gap_closed() {
        let orderer = PacketOrderer::new(Duration::from_secs(60), 100);
        orderer.restore_order(session_start(1, 1001));
        orderer.restore_order(packet(3));
        tokio::time::advance(Duration::from_secs(61)).await;

        let expired = orderer.expired_streams();
        assert_eq!(expired, vec!["accountId:0:ps-mpa-0".to_string()]);

        // The missing packet arrives between the check and the flush
        assert_eq!(sequences(&orderer.restore_order(packet(2))), vec![2, 3]);
        assert!(orderer.flush_expired(&expired[0]).is_none());
        assert_eq!(sequences(&orderer.restore_order(packet(4))), vec![4]);
    }
}
