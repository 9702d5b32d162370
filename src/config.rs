//! 엔드포인트 설정
//!
//! 클로저가 아닌 옵션(주소, 포트, 버퍼 크기, 폴링 간격)만 담는다.
//! 버퍼 생성기, 소켓 훅, 핸들러, 워커 풀은 각 빌더에서 지정한다.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_CHANNEL_BUFFER_SIZE, DEFAULT_PACKET_BUFFER_SIZE};

/// TCP 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// 바인드 주소
    pub address: IpAddr,

    /// 바인드 포트 (0이면 시스템 할당)
    pub port: u16,

    /// listen 백로그 (최대 대기 연결 수)
    pub max_connection: i32,

    /// 채널당 백로그 버퍼 최대 크기 (바이트)
    pub channel_buffer_size: usize,

    /// 채널 읽기 타임아웃
    /// 유닉스에서는 읽기가 기다리지 않으므로 쓰이지 않는다.
    /// 그 밖의 플랫폼에서 한 번의 읽기가 워커를 붙잡는 최대 시간
    pub read_timeout: Duration,

    /// 디스패치 루프 스캔 간격
    pub dispatch_interval: Duration,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_connection: 128,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            read_timeout: Duration::from_millis(5),
            dispatch_interval: Duration::from_millis(1),
        }
    }
}

impl TcpServerConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 지연 시간 우선 설정 (짧은 폴링, 작은 버퍼)
    pub fn low_latency() -> Self {
        Self {
            channel_buffer_size: 16 * 1024,
            read_timeout: Duration::from_millis(1),
            dispatch_interval: Duration::from_micros(200),
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        check_buffer_size("channel_buffer_size", self.channel_buffer_size)?;
        check_duration("read_timeout", self.read_timeout)?;
        check_duration("dispatch_interval", self.dispatch_interval)?;
        if self.max_connection <= 0 {
            return Err(Error::config(format!(
                "max_connection은 0보다 커야 함: {}",
                self.max_connection
            )));
        }
        Ok(())
    }
}

/// TCP 클라이언트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// 접속 대상 호스트 이름 또는 주소
    pub host_name: String,

    /// 접속 대상 포트
    pub port: u16,

    /// 채널 백로그 버퍼 최대 크기 (바이트)
    pub channel_buffer_size: usize,

    /// 채널 읽기 타임아웃
    pub read_timeout: Duration,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            host_name: Ipv4Addr::LOCALHOST.to_string(),
            port: 0,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            read_timeout: Duration::from_millis(5),
        }
    }
}

impl TcpClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn low_latency() -> Self {
        Self {
            channel_buffer_size: 16 * 1024,
            read_timeout: Duration::from_millis(1),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_buffer_size("channel_buffer_size", self.channel_buffer_size)?;
        check_duration("read_timeout", self.read_timeout)?;
        if self.host_name.is_empty() {
            return Err(Error::config("host_name이 비어 있음"));
        }
        Ok(())
    }
}

/// UDP 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpServerConfig {
    /// 바인드 주소
    pub address: IpAddr,

    /// 바인드 포트 (0이면 시스템 할당)
    pub port: u16,

    /// 데이터그램 수신 버퍼 크기 (바이트)
    /// 이보다 큰 데이터그램은 잘린다
    pub packet_buffer_size: usize,

    /// 수신 타임아웃
    /// 수신 루프가 종료 요청을 확인하는 주기
    pub receive_timeout: Duration,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            receive_timeout: Duration::from_millis(50),
        }
    }
}

impl UdpServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn low_latency() -> Self {
        Self {
            packet_buffer_size: 1500,
            receive_timeout: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_buffer_size("packet_buffer_size", self.packet_buffer_size)?;
        check_duration("receive_timeout", self.receive_timeout)
    }
}

fn check_buffer_size(name: &str, size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::config(format!("{}는 0보다 커야 함", name)));
    }
    Ok(())
}

fn check_duration(name: &str, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(Error::config(format!("{}는 0일 수 없음", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TcpServerConfig::default().validate().is_ok());
        assert!(TcpClientConfig::default().validate().is_ok());
        assert!(UdpServerConfig::default().validate().is_ok());
        assert!(TcpServerConfig::low_latency().validate().is_ok());
        assert!(UdpServerConfig::low_latency().validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut config = TcpServerConfig::new();
        config.channel_buffer_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = UdpServerConfig::new();
        config.packet_buffer_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = TcpClientConfig::new();
        config.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
