//! 핸들러 체인
//!
//! 채널마다 읽기 사이클이 끝나면 압축된 버퍼를 첫 핸들러에 넘기고,
//! 각 핸들러의 반환값을 다음 핸들러의 입력으로 넘긴다.
//! - `Some(message)`: 다음 핸들러로 전달
//! - `None`: 이번 사이클 체인 중단
//! - `Err`: 체인 중단, 예외 콜백으로 라우팅

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::TcpChannel;
use crate::udp::{PacketContext, UdpHeader};
use crate::{Error, Result};

/// 체인을 따라 흐르는 메시지
pub enum Message<'a> {
    /// 압축된 채널/패킷 버퍼
    ///
    /// 핸들러가 소비한 접두사(`advance`, `split_to`)는 다음 사이클에서 사라지고
    /// 나머지는 백로그로 남는다.
    Buffer(&'a mut Bytes),

    /// 디코딩된 값
    Value(Box<dyn Any + Send>),
}

impl<'a> Message<'a> {
    /// 값 메시지 생성
    pub fn value<T: Any + Send>(value: T) -> Self {
        Message::Value(Box::new(value))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Message::Buffer(_))
    }

    /// 버퍼 재대여
    pub fn as_buffer(&mut self) -> Option<&mut Bytes> {
        match self {
            Message::Buffer(buf) => Some(&mut **buf),
            Message::Value(_) => None,
        }
    }

    pub fn into_buffer(self) -> Option<&'a mut Bytes> {
        match self {
            Message::Buffer(buf) => Some(buf),
            Message::Value(_) => None,
        }
    }

    /// 값 꺼내기. 타입이 다르면 원래 메시지를 돌려준다
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        match self {
            Message::Value(value) => value.downcast::<T>().map(|v| *v).map_err(Message::Value),
            other => Err(other),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Message::Value(value) => value.downcast_ref::<T>(),
            Message::Buffer(_) => None,
        }
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.len()).finish(),
            Message::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// TCP 채널 메시지 핸들러
pub trait ChannelHandler: Send + Sync {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>>;
}

/// UDP 패킷 핸들러
pub trait PacketHandler: Send + Sync {
    fn on_packet<'a>(
        &self,
        context: &PacketContext,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>>;
}

/// TCP 엔드포인트 생명주기 콜백
///
/// 모든 메서드는 기본 구현이 비어 있어 필요한 것만 구현하면 된다.
pub trait ChannelLifecycle: Send + Sync {
    /// 채널당 한 번, 어떤 `on_message`보다 먼저
    fn on_open(&self, _channel: &TcpChannel) {}

    /// 채널당 한 번, 마지막 `on_loop` 이후. `remainder`는 소비되지 않은 백로그
    fn on_close(&self, _channel: &TcpChannel, _remainder: &Bytes) {}

    /// 전송/핸들러 에러. accept 실패처럼 채널이 없으면 `channel`은 None
    fn on_exception(&self, _channel: Option<&TcpChannel>, _remainder: &Bytes, _error: &Error) {}

    /// 매 처리 사이클 끝. `has_data`는 이번 사이클에 새 바이트가 있었는지
    fn on_loop(&self, _channel: &TcpChannel, _has_data: bool, _backlog: &Bytes) {}
}

/// UDP 서버 생명주기 콜백
pub trait PacketLifecycle: Send + Sync {
    fn on_open(&self, _local: SocketAddr) {}

    fn on_close(&self, _local: SocketAddr) {}

    /// 수신/핸들러 에러. 수신 에러면 `header`는 None
    fn on_exception(&self, _header: Option<&UdpHeader>, _error: &Error) {}
}

/// 아무 것도 하지 않는 생명주기
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl ChannelLifecycle for NoopLifecycle {}

impl PacketLifecycle for NoopLifecycle {}

/// 체인 실행
///
/// 첫 에러에서 멈추고 그 에러를 그대로 돌려준다.
pub(crate) fn run_chain<'a, H: ?Sized>(
    handlers: &[Arc<H>],
    message: Message<'a>,
    mut invoke: impl FnMut(&H, Message<'a>) -> Result<Option<Message<'a>>>,
) -> Result<()> {
    let mut message = message;
    for handler in handlers {
        match invoke(handler.as_ref(), message)? {
            Some(next) => message = next,
            None => break,
        }
    }
    Ok(())
}

/// 빌드 시점 핸들러 목록 검증
pub(crate) fn require_handlers<H: ?Sized>(handlers: Vec<Arc<H>>) -> Result<Arc<[Arc<H>]>> {
    if handlers.is_empty() {
        return Err(Error::config("핸들러가 하나 이상 필요함"));
    }
    Ok(handlers.into())
}
