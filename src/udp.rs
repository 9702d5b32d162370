//! UDP 서버
//!
//! 수신 스레드 하나가 데이터그램을 받아 복사한 뒤 패킷마다 태스크를
//! 워커 풀에 제출한다. 패킷 사이에는 순서가 없다.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::buffer::{check_generator, default_generator, BufferGenerator};
use crate::config::UdpServerConfig;
use crate::endpoint::{Endpoint, EndpointState, Latch, SocketConfig, StateCell};
use crate::handler::{
    require_handlers, run_chain, Message, NoopLifecycle, PacketHandler, PacketLifecycle,
};
use crate::pool::{require_multi_threaded, WorkerPool};
use crate::stats::{EndpointStats, StatsSnapshot};
use crate::{Error, Result};

/// 데이터그램 송신자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHeader {
    address: IpAddr,
    port: u16,
}

impl UdpHeader {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for UdpHeader {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for UdpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// 수신한 데이터그램 하나
#[derive(Debug, Clone)]
pub struct UdpPacket {
    header: UdpHeader,
    data: Bytes,
}

impl UdpPacket {
    pub fn new(header: UdpHeader, data: Bytes) -> Self {
        Self { header, data }
    }

    pub fn header(&self) -> &UdpHeader {
        &self.header
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_parts(self) -> (UdpHeader, Bytes) {
        (self.header, self.data)
    }
}

/// 패킷 핸들러에 넘겨지는 문맥 (송신자와 응답용 소켓)
pub struct PacketContext {
    header: UdpHeader,
    socket: Arc<UdpSocket>,
    stats: Arc<EndpointStats>,
}

impl PacketContext {
    pub fn header(&self) -> &UdpHeader {
        &self.header
    }

    /// 송신자에게 응답
    pub fn reply(&self, data: &[u8]) -> Result<usize> {
        self.send_to(self.header.socket_addr(), data)
    }

    pub fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<usize> {
        let sent = self.socket.send_to(data, target)?;
        self.stats.record_sent(sent);
        Ok(sent)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketContext")
            .field("header", &self.header)
            .finish()
    }
}

/// UDP 서버 빌더
pub struct UdpServerBuilder {
    config: UdpServerConfig,
    generator: BufferGenerator,
    socket_config: Option<SocketConfig>,
    pool: Option<WorkerPool>,
    lifecycle: Arc<dyn PacketLifecycle>,
    handlers: Vec<Arc<dyn PacketHandler>>,
}

impl UdpServerBuilder {
    pub fn new() -> Self {
        Self {
            config: UdpServerConfig::default(),
            generator: default_generator(),
            socket_config: None,
            pool: None,
            lifecycle: Arc::new(NoopLifecycle),
            handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: UdpServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// 데이터그램 수신 버퍼 크기
    pub fn packet_buffer_size(mut self, size: usize) -> Self {
        self.config.packet_buffer_size = size;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    pub fn buffer_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(usize) -> bytes::BytesMut + Send + Sync + 'static,
    {
        self.generator = Arc::new(generator);
        self
    }

    /// bind 전에 적용할 소켓 설정
    pub fn socket_config<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Socket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.socket_config = Some(Arc::new(hook));
        self
    }

    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl PacketLifecycle + 'static) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn shared_lifecycle(mut self, lifecycle: Arc<dyn PacketLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn handler(mut self, handler: impl PacketHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<UdpServer> {
        self.config.validate()?;
        check_generator(&self.generator, self.config.packet_buffer_size)?;
        let handlers = require_handlers(self.handlers)?;
        let pool = require_multi_threaded(self.pool)?;

        Ok(UdpServer {
            inner: Arc::new(UdpInner {
                config: self.config,
                generator: self.generator,
                socket_config: self.socket_config,
                pool,
                lifecycle: self.lifecycle,
                handlers,
                state: StateCell::new(EndpointState::Created),
                socket: Mutex::new(None),
                local_addr: OnceLock::new(),
                in_flight: AtomicUsize::new(0),
                receive_exited: AtomicBool::new(false),
                close_fired: AtomicBool::new(false),
                latch: Latch::new(),
                stats: Arc::new(EndpointStats::new()),
            }),
        })
    }
}

impl Default for UdpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct UdpInner {
    config: UdpServerConfig,
    generator: BufferGenerator,
    socket_config: Option<SocketConfig>,
    pool: WorkerPool,
    lifecycle: Arc<dyn PacketLifecycle>,
    handlers: Arc<[Arc<dyn PacketHandler>]>,
    state: StateCell,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: OnceLock<SocketAddr>,

    /// 제출됐지만 끝나지 않은 패킷 태스크 수
    in_flight: AtomicUsize,
    receive_exited: AtomicBool,
    close_fired: AtomicBool,
    latch: Latch,
    stats: Arc<EndpointStats>,
}

/// UDP 서버 (복제 시 같은 서버를 공유)
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<UdpInner>,
}

impl fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpServer")
            .field("state", &self.inner.state.get())
            .field("local_addr", &self.inner.local_addr.get())
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl UdpServer {
    pub fn builder() -> UdpServerBuilder {
        UdpServerBuilder::new()
    }

    /// bind 후 수신 스레드 시작
    ///
    /// `block`이면 서버가 완전히 끝날 때까지 반환하지 않는다.
    pub fn start(&self, block: bool) -> Result<()> {
        let inner = &self.inner;
        inner.state.ensure(EndpointState::Created)?;

        let socket = inner.bind()?;
        let local = socket.local_addr()?;
        inner.state.transition(EndpointState::Created, EndpointState::Opened)?;
        let _ = inner.local_addr.set(local);

        let socket = Arc::new(socket);
        *inner.socket.lock() = Some(socket.clone());

        info!(
            "UDP 서버 시작: {} (workers={}, packet_buffer={})",
            local,
            inner.pool.threads(),
            inner.config.packet_buffer_size
        );
        inner.lifecycle.on_open(local);

        let receiver = inner.clone();
        thread::Builder::new()
            .name(format!("sockloop-udp-{}", local.port()))
            .spawn(move || receiver.receive_loop(socket))?;

        if block {
            inner.latch.wait(None);
        }
        Ok(())
    }

    /// 데이터그램 송신
    pub fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<usize> {
        self.inner.state.ensure(EndpointState::Opened)?;
        let socket = self.source().ok_or(Error::ConnectionClosed)?;
        let sent = socket.send_to(data, target)?;
        self.inner.stats.record_sent(sent);
        Ok(sent)
    }

    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.latch.wait(timeout)
    }

    /// 원시 소켓 (열려 있는 동안만)
    pub fn source(&self) -> Option<Arc<UdpSocket>> {
        self.inner.socket.lock().clone()
    }

    /// 처리 중인 패킷 수
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &UdpServerConfig {
        &self.inner.config
    }
}

impl UdpInner {
    fn bind(&self) -> Result<UdpSocket> {
        let addr = SocketAddr::new(self.config.address, self.config.port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(hook) = &self.socket_config {
            hook(&socket)?;
        }
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(self.config.receive_timeout))?;
        Ok(socket.into())
    }

    fn is_opened(&self) -> bool {
        self.state.get() == EndpointState::Opened
    }

    fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        debug!("UDP 수신 루프 시작");
        let mut buf = vec![0u8; self.config.packet_buffer_size];

        while self.is_opened() {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => self.dispatch(&socket, &buf[..n], from),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    if !self.is_opened() {
                        break;
                    }
                    warn!("UDP 수신 에러: {}", e);
                    self.stats.record_transport_error();
                    self.lifecycle.on_exception(None, &Error::Io(e));
                }
            }
        }

        drop(socket);
        self.receive_exited.store(true, Ordering::SeqCst);
        debug!("UDP 수신 루프 종료");
        self.try_drain();
    }

    /// 데이터를 생성기 버퍼로 복사하고 태스크 제출
    fn dispatch(self: &Arc<Self>, socket: &Arc<UdpSocket>, data: &[u8], from: SocketAddr) {
        let header = UdpHeader::from(from);
        let mut payload = (self.generator)(data.len());
        payload.extend_from_slice(data);
        let packet = UdpPacket::new(header, payload.freeze());

        trace!("{} bytes 수신: {}", data.len(), header);
        self.stats.record_packet(data.len());

        let flight = InFlight::enter(self.clone());
        let socket = socket.clone();
        let submitted = self.pool.execute(move || {
            flight.0.handle_packet(socket, packet);
            drop(flight);
        });
        if let Err(e) = submitted {
            debug!("패킷 버림 ({}): {}", header, e);
        }
    }

    fn handle_packet(&self, socket: Arc<UdpSocket>, packet: UdpPacket) {
        let (header, mut data) = packet.into_parts();
        let context = PacketContext {
            header,
            socket,
            stats: self.stats.clone(),
        };

        let result = run_chain(&self.handlers, Message::Buffer(&mut data), |handler, message| {
            handler.on_packet(&context, message)
        });
        if let Err(e) = result {
            debug!("패킷 핸들러 에러 ({}): {}", header, e);
            self.stats.record_handler_error();
            self.lifecycle.on_exception(Some(&header), &e);
        }
    }

    /// 수신 루프가 끝났고 처리 중인 패킷이 없으면 onClose 후 래치 해제
    fn try_drain(&self) {
        if !self.receive_exited.load(Ordering::SeqCst) {
            return;
        }
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(local) = self.local_addr.get() {
            self.lifecycle.on_close(*local);
        }
        info!("UDP 서버 종료 완료: {}", self.stats.snapshot().summary());
        self.latch.release();
    }

    fn shut_socket(&self) -> Result<()> {
        let state = self.state.get();
        if state == EndpointState::Created {
            return Err(Error::InvalidState {
                expected: EndpointState::Opened,
                got: state,
            });
        }
        if self.state.close() {
            info!("UDP 서버 종료 요청 (처리 중 {}개)", self.in_flight.load(Ordering::Acquire));
            self.socket.lock().take();
        }
        Ok(())
    }
}

/// 패킷 태스크 수명 동안 `in_flight`를 올려 둔다
///
/// 태스크가 제출되지 못했거나 패닉이 나도 drop에서 되돌리고 정리를 시도한다.
struct InFlight(Arc<UdpInner>);

impl InFlight {
    fn enter(inner: Arc<UdpInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.try_drain();
    }
}

impl Endpoint for UdpServer {
    fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        self.inner.state.ensure(EndpointState::Opened)?;
        self.inner
            .local_addr
            .get()
            .copied()
            .ok_or_else(|| Error::Unknown("바인드 주소 없음".to_string()))
    }

    /// 수신을 멈추고 처리 중인 패킷이 끝날 때까지 대기
    fn close(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.shut_socket()?;
        Ok(self.inner.latch.wait(timeout))
    }

    /// 수신을 멈추고 워커 풀도 종료한다
    fn close_now(&self) -> Result<()> {
        self.inner.shut_socket()?;
        self.inner.pool.shutdown();
        Ok(())
    }
}
