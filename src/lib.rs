//! # sockloop
//!
//! 블로킹 소켓 기반 TCP/UDP 엔드포인트 프레임워크
//!
//! ## 핵심 특징
//! - **핸들러 체인**: 압축된 수신 버퍼를 핸들러 목록에 차례로 통과
//! - **백로그 압축**: 소비되지 않은 바이트는 다음 사이클에 새 데이터와 합쳐짐
//! - **단일 처리 보장**: 채널 하나에는 동시에 처리 태스크 하나만 실행
//! - **워커 풀 디스패치**: 느린 연결이 다른 연결을 막지 않음
//! - **완료 래치**: `close(timeout)`은 정리가 끝날 때까지 대기, `close_now()`는 즉시 반환
//!
//! ## 예시
//! ```no_run
//! use sockloop::{ChannelHandler, Message, TcpChannel, TcpServer, WorkerPool};
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {
//!     fn on_message<'a>(
//!         &self,
//!         channel: &TcpChannel,
//!         message: Message<'a>,
//!     ) -> sockloop::Result<Option<Message<'a>>> {
//!         if let Some(buf) = message.into_buffer() {
//!             channel.send(&buf[..])?;
//!             buf.clear();
//!         }
//!         Ok(None)
//!     }
//! }
//!
//! # fn main() -> sockloop::Result<()> {
//! let server = TcpServer::builder()
//!     .port(9000)
//!     .worker_pool(WorkerPool::new(4)?)
//!     .handler(Echo)
//!     .build()?;
//! server.start(true)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod pool;
pub mod server;
pub mod stats;
pub mod udp;

pub use buffer::{compact, default_generator, BufferGenerator};
pub use channel::{ChannelId, TcpChannel};
pub use client::{TcpClient, TcpClientBuilder};
pub use codec::{DelimiterBasedChannelHandler, LengthBasedChannelHandler};
pub use config::{TcpClientConfig, TcpServerConfig, UdpServerConfig};
pub use endpoint::{Endpoint, EndpointState, SocketConfig};
pub use error::{Error, Result};
pub use handler::{
    ChannelHandler, ChannelLifecycle, Message, NoopLifecycle, PacketHandler, PacketLifecycle,
};
pub use pool::WorkerPool;
pub use server::{TcpServer, TcpServerBuilder};
pub use stats::{EndpointStats, StatsSnapshot};
pub use udp::{PacketContext, UdpHeader, UdpPacket, UdpServer, UdpServerBuilder};

/// 소켓 설정 훅에서 쓰는 socket2 재노출
pub use socket2;

/// 기본 채널 버퍼 크기 (바이트)
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// 기본 UDP 패킷 버퍼 크기 (바이트, 최대 UDP 페이로드)
pub const DEFAULT_PACKET_BUFFER_SIZE: usize = 65535;
