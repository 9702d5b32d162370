//! 엔드포인트 통계
//!
//! 엔드포인트와 그 채널들이 함께 갱신하는 원자 카운터

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 엔드포인트 통계 (원자 카운터)
#[derive(Debug)]
pub struct EndpointStats {
    start_time: Instant,
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    read_cycles: AtomicU64,
    handler_errors: AtomicU64,
    transport_errors: AtomicU64,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            channels_opened: AtomicU64::new(0),
            channels_closed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            read_cycles: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_packet(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.record_received(bytes);
    }

    pub(crate) fn record_cycle(&self) {
        self.read_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값 스냅샷
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            read_cycles: self.read_cycles.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// 경과 시간
    pub elapsed: Duration,

    /// 열린 채널 수 (onOpen 발생)
    pub channels_opened: u64,

    /// 닫힌 채널 수 (onClose 발생)
    pub channels_closed: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// 송신 바이트
    pub bytes_sent: u64,

    /// 수신 데이터그램 수
    pub packets_received: u64,

    /// 읽기/처리 사이클 수
    pub read_cycles: u64,

    /// 핸들러 에러 수
    pub handler_errors: u64,

    /// 전송 계층 에러 수
    pub transport_errors: u64,
}

impl StatsSnapshot {
    /// 현재 살아 있는 채널 수
    pub fn live_channels(&self) -> u64 {
        self.channels_opened.saturating_sub(self.channels_closed)
    }

    /// 수신 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Channels: {}/{} | Rx: {} B | Tx: {} B | Packets: {} | Throughput: {:.2} MB/s | Errors: {}/{}",
            self.elapsed.as_secs_f64(),
            self.live_channels(),
            self.channels_opened,
            self.bytes_received,
            self.bytes_sent,
            self.packets_received,
            self.throughput() / 1_000_000.0,
            self.handler_errors,
            self.transport_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = EndpointStats::new();
        stats.record_channel_opened();
        stats.record_channel_opened();
        stats.record_channel_closed();
        stats.record_received(10);
        stats.record_packet(5);
        stats.record_sent(3);

        let snap = stats.snapshot();
        assert_eq!(snap.live_channels(), 1);
        assert_eq!(snap.bytes_received, 15);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_sent, 3);
        assert!(snap.summary().contains("Channels: 1/2"));
    }
}
