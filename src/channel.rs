//! TCP 채널
//!
//! 수락되었거나 연결된 소켓 하나를 감싼다.
//! - 송신: 채널 단위로 직렬화 (여러 스레드에서 동시에 호출해도 안전)
//! - 수신: 소유자(서버 태스크 또는 클라이언트 루프) 하나만 백로그를 만진다
//! - 서버 측 플래그: `locked`(처리 중), `opened`(onOpen 발생), `closed`(onClose 발생)
//! - 서버 채널은 논블로킹으로 읽어 유휴 채널이 워커를 붙잡지 않는다

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::ops::Deref;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, trace};

use crate::buffer::{compact, BufferGenerator};
use crate::endpoint::{Endpoint, EndpointState, Latch, StateCell};
use crate::handler::{run_chain, ChannelHandler, ChannelLifecycle, Message};
use crate::stats::EndpointStats;
use crate::{Error, Result};

/// 엔드포인트 안에서 채널을 가리키는 ID
pub type ChannelId = u64;

/// 수신 대기 없이 돌아오는 recv 플래그
#[cfg(unix)]
const POLL_FLAGS: c_int = libc::MSG_DONTWAIT;

/// MSG_DONTWAIT가 없으면 `read_timeout`이 대기 상한
#[cfg(not(unix))]
const POLL_FLAGS: c_int = 0;

/// 채널 수신 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// 준비된 바이트만 가져오고 없으면 바로 `Empty` (워커 풀 태스크)
    Poll,

    /// `read_timeout`까지 대기 (전용 스레드)
    Blocking,
}

/// 채널 생성 설정 (엔드포인트가 공유)
#[derive(Clone)]
pub(crate) struct ChannelSettings {
    pub(crate) buffer_size: usize,
    pub(crate) read_timeout: Duration,
    pub(crate) read_mode: ReadMode,
    pub(crate) generator: BufferGenerator,
    pub(crate) stats: Arc<EndpointStats>,
}

/// 한 번의 읽기 결과
#[derive(Debug)]
pub(crate) enum Readiness {
    /// 상대가 닫았거나 I/O 에러. 채널을 정리해야 함
    Closed,

    /// 새 데이터 없음 (또는 백로그가 가득 참)
    Empty,

    /// 새로 읽은 바이트
    Data(Bytes),
}

/// 연결 하나
pub struct TcpChannel {
    id: ChannelId,
    stream: TcpStream,

    /// 첫 송신 때 여는 송신 스트림
    writer: Mutex<Option<TcpStream>>,

    /// 핸들러가 아직 소비하지 않은 바이트
    backlog: Mutex<Bytes>,

    /// 수신용 재사용 버퍼
    scratch: Mutex<BytesMut>,

    /// 지금 이 채널의 콜백을 돌리고 있는 스레드
    owner: Mutex<Option<ThreadId>>,

    remote: SocketAddr,
    local: SocketAddr,
    settings: ChannelSettings,
    state: StateCell,

    /// 양방향 종료 요청됨 (다음 사이클에서 정리)
    hard_closed: AtomicBool,

    locked: AtomicBool,
    opened: AtomicBool,
    closed: AtomicBool,

    /// `closed`가 설정되면 해제
    latch: Latch,
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state.get())
            .field("locked", &self.is_locked())
            .field("opened", &self.is_announced())
            .field("closed", &self.is_released())
            .finish()
    }
}

impl TcpChannel {
    pub(crate) fn new(id: ChannelId, stream: TcpStream, settings: ChannelSettings) -> Result<Self> {
        stream.set_read_timeout(Some(settings.read_timeout))?;
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;

        Ok(Self {
            id,
            stream,
            writer: Mutex::new(None),
            backlog: Mutex::new(Bytes::new()),
            scratch: Mutex::new(BytesMut::new()),
            owner: Mutex::new(None),
            remote,
            local,
            settings,
            state: StateCell::new(EndpointState::Opened),
            hard_closed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            latch: Latch::new(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// 상대 주소 (닫힌 뒤에도 조회 가능)
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// 백로그 버퍼 최대 크기
    ///
    /// 이보다 큰 프레임은 백로그에 다 들어오지 못한다.
    pub fn buffer_size(&self) -> usize {
        self.settings.buffer_size
    }

    /// 원시 소켓
    pub fn source(&self) -> &TcpStream {
        &self.stream
    }

    /// 현재 백로그 스냅샷 (읽기 전용)
    ///
    /// 처리 사이클 도중에는 비어 보인다.
    pub fn backlog(&self) -> Bytes {
        self.backlog.lock().clone()
    }

    // ─────────────────────────────────────────────────────────────────
    // 송신
    // ─────────────────────────────────────────────────────────────────

    fn with_writer<T>(&self, op: impl FnOnce(&mut TcpStream) -> io::Result<T>) -> Result<T> {
        self.state.ensure(EndpointState::Opened)?;

        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(self.stream.try_clone()?);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        Ok(op(writer)?)
    }

    /// 바이트 송신
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.with_writer(|w| w.write_all(data))?;
        self.settings.stats.record_sent(data.len());
        Ok(())
    }

    /// 버퍼 송신 (남은 바이트 전부)
    pub fn send_buf(&self, mut buf: impl Buf) -> Result<()> {
        let total = buf.remaining();
        self.with_writer(|w| {
            while buf.has_remaining() {
                let chunk = buf.chunk();
                let n = chunk.len();
                w.write_all(chunk)?;
                buf.advance(n);
            }
            Ok(())
        })?;
        self.settings.stats.record_sent(total);
        Ok(())
    }

    /// 스트림 내용을 끝까지 송신. 보낸 바이트 수 반환
    pub fn send_from<R: Read>(&self, reader: &mut R) -> Result<u64> {
        let sent = self.with_writer(|w| io::copy(reader, w))?;
        self.settings.stats.record_sent(sent as usize);
        Ok(sent)
    }

    pub fn flush(&self) -> Result<()> {
        self.with_writer(|w| w.flush())
    }

    // ─────────────────────────────────────────────────────────────────
    // 수신 / 처리 사이클
    // ─────────────────────────────────────────────────────────────────

    /// 최대 `buffer_size - backlog_len` 바이트를 읽는다
    ///
    /// 백로그가 가득 차면 읽지 않고 `Empty`를 돌려준다.
    /// `Poll` 모드면 도착한 바이트가 없을 때 기다리지 않는다.
    pub(crate) fn available_or_closed(&self, backlog_len: usize) -> Readiness {
        let capacity = self.settings.buffer_size.saturating_sub(backlog_len);
        if capacity == 0 {
            trace!(channel = self.id, "백로그 가득 참, 읽기 보류");
            return Readiness::Empty;
        }

        let flags = match self.settings.read_mode {
            ReadMode::Poll => POLL_FLAGS,
            ReadMode::Blocking => 0,
        };

        // 이전 사이클의 조각이 해제됐으면 같은 할당을 다시 쓴다
        let mut scratch = self.scratch.lock();
        scratch.clear();
        scratch.reserve(capacity);

        let socket = SockRef::from(&self.stream);
        let received = socket.recv_with_flags(&mut scratch.spare_capacity_mut()[..capacity], flags);
        match received {
            Ok(0) => Readiness::Closed,
            Ok(n) => {
                // SAFETY: recv가 여유 공간의 앞 n 바이트를 채웠다
                unsafe { scratch.set_len(n) };
                Readiness::Data(scratch.split().freeze())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Readiness::Empty
            }
            Err(e) => {
                debug!(channel = self.id, "읽기 에러, 채널 종료: {}", e);
                self.settings.stats.record_transport_error();
                Readiness::Closed
            }
        }
    }

    /// 읽기 → 압축 → 체인 → 재압축 → onLoop
    ///
    /// 채널이 정리됐으면 false
    pub(crate) fn handle_cycle(
        &self,
        handlers: &[Arc<dyn ChannelHandler>],
        lifecycle: &dyn ChannelLifecycle,
    ) -> bool {
        let _owner = self.mark_owner();
        if self.hard_closed.load(Ordering::Acquire) {
            self.teardown(lifecycle);
            return false;
        }

        let backlog = std::mem::take(&mut *self.backlog.lock());
        let fresh = match self.available_or_closed(backlog.len()) {
            Readiness::Closed => {
                *self.backlog.lock() = backlog;
                self.teardown(lifecycle);
                return false;
            }
            Readiness::Empty => None,
            Readiness::Data(bytes) => {
                trace!(channel = self.id, "{} bytes 수신", bytes.len());
                self.settings.stats.record_received(bytes.len());
                Some(bytes)
            }
        };
        self.settings.stats.record_cycle();

        let has_data = fresh.is_some();
        let generator = &*self.settings.generator;
        let mut buffer = compact(Some(&backlog), fresh.as_deref(), generator);
        drop(backlog);

        if !buffer.is_empty() {
            let result = run_chain(handlers, Message::Buffer(&mut buffer), |handler, message| {
                handler.on_message(self, message)
            });
            if let Err(e) = result {
                debug!(channel = self.id, "핸들러 에러: {}", e);
                self.settings.stats.record_handler_error();
                lifecycle.on_exception(Some(self), &buffer, &e);
            }
        }

        let remainder = compact(Some(&buffer), None, generator);
        *self.backlog.lock() = remainder.clone();
        lifecycle.on_loop(self, has_data, &remainder);
        true
    }

    /// onOpen 1회 발생
    pub(crate) fn announce(&self, lifecycle: &dyn ChannelLifecycle) {
        if self.opened.swap(true, Ordering::AcqRel) {
            return;
        }
        let _owner = self.mark_owner();
        debug!(channel = self.id, remote = %self.remote, "채널 열림");
        self.settings.stats.record_channel_opened();
        lifecycle.on_open(self);
    }

    /// 소켓 정리 후 onClose 1회 발생
    pub(crate) fn teardown(&self, lifecycle: &dyn ChannelLifecycle) {
        if self.is_released() {
            return;
        }
        let _owner = self.mark_owner();
        self.state.close();

        let remainder = std::mem::take(&mut *self.backlog.lock());
        {
            // 진행 중인 송신이 끝날 때까지 대기
            let _writer = self.writer.lock();
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    self.settings.stats.record_transport_error();
                    lifecycle.on_exception(Some(self), &remainder, &Error::Io(e));
                }
            }
        }

        debug!(channel = self.id, remote = %self.remote, "채널 닫힘");
        lifecycle.on_close(self, &remainder);
        self.settings.stats.record_channel_closed();
        self.closed.store(true, Ordering::Release);
        self.latch.release();
    }

    /// 현재 스레드를 콜백 소유자로 표시 (중첩 시 이전 값 복원)
    fn mark_owner(&self) -> OwnerMark<'_> {
        let previous = self.owner.lock().replace(thread::current().id());
        OwnerMark {
            slot: &self.owner,
            previous,
        }
    }

    /// 이 채널의 콜백 안에서 호출됐는지
    fn is_owner(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    // ─────────────────────────────────────────────────────────────────
    // 단일 처리 보장
    // ─────────────────────────────────────────────────────────────────

    /// 처리 중이 아니면 잠그고 가드 반환
    pub(crate) fn try_lock(self: &Arc<Self>) -> Option<FlightGuard> {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(self.clone()))
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// onOpen 발생 여부
    pub(crate) fn is_announced(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// onClose 발생 여부 (레지스트리에서 제거 대상)
    pub(crate) fn is_released(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Endpoint for TcpChannel {
    fn state(&self) -> EndpointState {
        self.state.get()
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        self.state.ensure(EndpointState::Opened)?;
        Ok(self.remote)
    }

    /// 송신 측을 반쯤 닫고 소유자가 채널을 정리할 때까지 대기
    ///
    /// 시간 안에 정리되지 않으면 양방향으로 닫는다.
    /// 핸들러나 라이프사이클 콜백 안에서 부르면 기다리지 않고
    /// `close_now`로 넘어가며 false를 돌려준다. 정리는 현재 사이클이 끝난 뒤 일어난다.
    fn close(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.is_released() {
            return Ok(true);
        }
        if self.is_owner() {
            trace!(channel = self.id, "콜백 안에서 close 호출, 즉시 종료로 전환");
            self.close_now()?;
            return Ok(false);
        }

        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush()?;
        }
        self.state.close();
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e.into()),
            _ => {}
        }

        let drained = self.latch.wait(timeout);
        if !drained {
            self.close_now()?;
        }
        Ok(drained)
    }

    fn close_now(&self) -> Result<()> {
        self.state.close();
        self.hard_closed.store(true, Ordering::Release);
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

struct OwnerMark<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl Drop for OwnerMark<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = self.previous.take();
    }
}

/// 처리 태스크가 끝나면(패닉 포함) `locked`를 해제
pub(crate) struct FlightGuard(Arc<TcpChannel>);

impl Deref for FlightGuard {
    type Target = Arc<TcpChannel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}
