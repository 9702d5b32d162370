//! 기본 프레이밍 핸들러
//!
//! - 길이 기반: big-endian 길이 접두사 + 본문
//! - 구분자 기반: 구분자 바이트열로 끝나는 프레임
//!
//! 두 핸들러 모두 한 번 호출에 프레임 하나를 `Message::Value(Bytes)`로
//! 내보내고, 아직 완성되지 않았으면 `None`으로 체인을 멈춘다.
//! 남은 바이트는 백로그로 다음 사이클에 이어진다.
//!
//! 채널 버퍼에 다 들어올 수 없는 프레임은 영원히 완성되지 않으므로
//! `FrameTooLarge`를 돌려주고 채널을 닫는다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::channel::TcpChannel;
use crate::endpoint::Endpoint;
use crate::handler::{ChannelHandler, Message, PacketHandler};
use crate::udp::PacketContext;
use crate::{Error, Result};

/// 기본 최대 프레임 크기 (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// 길이 접두사 프레임 디코더
#[derive(Debug, Clone)]
pub struct LengthBasedChannelHandler {
    /// 길이 필드 크기 (1, 2, 4, 8 바이트)
    length_field_size: usize,

    /// 본문 최대 크기
    max_frame_size: usize,

    /// 출력 프레임에서 길이 필드 제거 여부
    strip_length: bool,
}

impl LengthBasedChannelHandler {
    pub fn new(length_field_size: usize) -> Result<Self> {
        if !matches!(length_field_size, 1 | 2 | 4 | 8) {
            return Err(Error::config(format!(
                "길이 필드 크기는 1, 2, 4, 8 중 하나: {}",
                length_field_size
            )));
        }
        Ok(Self {
            length_field_size,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            strip_length: true,
        })
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn strip_length(mut self, strip: bool) -> Self {
        self.strip_length = strip;
        self
    }

    /// 프레임 하나 디코딩. 불완전하면 None
    pub fn decode(&self, buf: &mut Bytes) -> Result<Option<Bytes>> {
        self.decode_within(buf, usize::MAX)
    }

    /// `capacity` 바이트까지만 쌓이는 버퍼에서 디코딩
    ///
    /// 접두사 포함 프레임이 `capacity`를 넘으면 에러.
    pub fn decode_within(&self, buf: &mut Bytes, capacity: usize) -> Result<Option<Bytes>> {
        let n = self.length_field_size;
        if buf.len() < n {
            return Ok(None);
        }

        let raw_len = (&buf[..n]).get_uint(n);
        let body_len = usize::try_from(raw_len).unwrap_or(usize::MAX);
        if body_len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }
        let Some(total) = n.checked_add(body_len) else {
            return Err(Error::FrameTooLarge {
                size: body_len,
                max: usize::MAX - n,
            });
        };
        if total > capacity {
            return Err(Error::FrameTooLarge {
                size: total,
                max: capacity,
            });
        }
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        if self.strip_length {
            frame.advance(n);
        }
        Ok(Some(frame))
    }

    /// 길이 접두사를 붙인 프레임 생성
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        let n = self.length_field_size;
        let limit = if n == 8 { u64::MAX } else { (1u64 << (n * 8)) - 1 };
        if payload.len() > self.max_frame_size || payload.len() as u64 > limit {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size.min(limit as usize),
            });
        }

        let mut out = BytesMut::with_capacity(n + payload.len());
        out.put_uint(payload.len() as u64, n);
        out.put_slice(payload);
        Ok(out.freeze())
    }

    fn decode_message<'a>(
        &self,
        message: Message<'a>,
        capacity: usize,
    ) -> Result<Option<Message<'a>>> {
        match message {
            Message::Buffer(buf) => Ok(self.decode_within(buf, capacity)?.map(Message::value)),
            other => Ok(Some(other)),
        }
    }
}

impl ChannelHandler for LengthBasedChannelHandler {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        self.decode_message(message, channel.buffer_size())
            .map_err(|e| abandon(channel, e))
    }
}

impl PacketHandler for LengthBasedChannelHandler {
    fn on_packet<'a>(
        &self,
        _context: &PacketContext,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        self.decode_message(message, usize::MAX)
    }
}

/// 프레임 경계를 잃은 스트림은 되살릴 수 없으므로 닫는다
fn abandon(channel: &TcpChannel, error: Error) -> Error {
    debug!(channel = channel.id(), "프레임 디코딩 실패, 채널 종료: {}", error);
    if let Err(e) = channel.close_now() {
        debug!(channel = channel.id(), "채널 종료 에러: {}", e);
    }
    error
}

/// 구분자 프레임 디코더
#[derive(Debug, Clone)]
pub struct DelimiterBasedChannelHandler {
    delimiter: Bytes,
    max_frame_size: usize,
    strip_delimiter: bool,
}

impl DelimiterBasedChannelHandler {
    pub fn new(delimiter: impl Into<Bytes>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(Error::config("구분자가 비어 있음"));
        }
        Ok(Self {
            delimiter,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            strip_delimiter: true,
        })
    }

    /// 줄 단위 (`\n`)
    pub fn lines() -> Self {
        Self {
            delimiter: Bytes::from_static(b"\n"),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            strip_delimiter: true,
        }
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn strip_delimiter(mut self, strip: bool) -> Self {
        self.strip_delimiter = strip;
        self
    }

    pub fn delimiter(&self) -> &Bytes {
        &self.delimiter
    }

    /// 프레임 하나 디코딩. 구분자가 아직 없으면 None
    pub fn decode(&self, buf: &mut Bytes) -> Result<Option<Bytes>> {
        self.decode_within(buf, usize::MAX)
    }

    /// `capacity` 바이트까지만 쌓이는 버퍼에서 디코딩
    ///
    /// 버퍼가 가득 찼는데 구분자가 없으면 에러.
    pub fn decode_within(&self, buf: &mut Bytes, capacity: usize) -> Result<Option<Bytes>> {
        let d = self.delimiter.len();
        let position = buf
            .windows(d)
            .position(|window| window == self.delimiter.as_ref());

        match position {
            Some(pos) => {
                if pos > self.max_frame_size {
                    return Err(Error::FrameTooLarge {
                        size: pos,
                        max: self.max_frame_size,
                    });
                }
                let mut frame = buf.split_to(pos + d);
                if self.strip_delimiter {
                    frame.truncate(pos);
                }
                Ok(Some(frame))
            }
            None if buf.len() > self.max_frame_size => Err(Error::FrameTooLarge {
                size: buf.len(),
                max: self.max_frame_size,
            }),
            None if buf.len() >= capacity => Err(Error::FrameTooLarge {
                size: buf.len(),
                max: capacity,
            }),
            None => Ok(None),
        }
    }

    fn decode_message<'a>(
        &self,
        message: Message<'a>,
        capacity: usize,
    ) -> Result<Option<Message<'a>>> {
        match message {
            Message::Buffer(buf) => Ok(self.decode_within(buf, capacity)?.map(Message::value)),
            other => Ok(Some(other)),
        }
    }
}

impl ChannelHandler for DelimiterBasedChannelHandler {
    fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        self.decode_message(message, channel.buffer_size())
            .map_err(|e| abandon(channel, e))
    }
}

impl PacketHandler for DelimiterBasedChannelHandler {
    fn on_packet<'a>(
        &self,
        _context: &PacketContext,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        self.decode_message(message, usize::MAX)
    }
}
