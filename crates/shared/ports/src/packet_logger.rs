use termsync_core::SynchronizationPacket;

/// Write-only audit sink. Receives packets after ordering, in dispatch order.
pub trait PacketLogger: Send + Sync {
    fn log_packet(&self, packet: &SynchronizationPacket);
}
